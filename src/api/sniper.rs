//! `/sniper/*` handlers (spec §6): start an orchestrator as a
//! background task and return its id immediately, plus the
//! agent-readable task views used to poll it.

use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use axum::Json;
use axum::extract::{Extension, Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::gate::ConnectorService;
use crate::identity::Identity;
use crate::orchestrators::{creator_monitor, harvest_analyze, trend_analysis};
use crate::task::store::TaskFilter;
use crate::task::TaskStatus;

use super::envelope;
use super::state::AppState;

fn gate_for(state: &AppState, identity: &Identity, task_id: Uuid) -> Arc<ConnectorService> {
    Arc::new(ConnectorService::new(
        state.lock_store.clone(),
        state.connector_registry.clone(),
        identity.source.clone(),
        identity.source_id.clone(),
        task_id,
    ))
}

#[derive(Deserialize)]
pub struct HarvestStartRequest {
    creator_ids: Vec<String>,
    #[serde(default = "default_window_days")]
    window_days: i64,
}

fn default_window_days() -> i64 {
    creator_monitor::DEFAULT_WINDOW_DAYS
}

pub async fn start_creator_monitor(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<HarvestStartRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .task_service
        .create_task(&identity.source, &identity.source_id, "creator_monitor")
        .await?;
    let task_id = task.id;
    let gate = gate_for(&state, &identity, task_id);
    let task_store = state.task_service.store().clone();

    state
        .task_service
        .spawn(task_id, creator_monitor::run(task_store, gate, task_id, req.creator_ids, req.window_days));

    Ok(envelope(json!({ "task_id": task_id })))
}

#[derive(Deserialize)]
pub struct TrendStartRequest {
    keywords: Vec<String>,
}

pub async fn start_trend_analysis(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<TrendStartRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .task_service
        .create_task(&identity.source, &identity.source_id, "trend_analysis")
        .await?;
    let task_id = task.id;
    let gate = gate_for(&state, &identity, task_id);
    let task_store = state.task_service.store().clone();
    let core_keyword = req.keywords.first().cloned().unwrap_or_default();

    state.task_service.spawn(
        task_id,
        trend_analysis::run(
            task_store,
            gate,
            state.planner_llm.clone(),
            state.analyst_llm.clone(),
            task_id,
            core_keyword,
        ),
    );

    Ok(envelope(json!({ "task_id": task_id })))
}

#[derive(Deserialize)]
pub struct WechatHarvestRequest {
    urls: Vec<String>,
    #[serde(default = "default_analysis_mode")]
    analysis_mode: String,
}

fn default_analysis_mode() -> String {
    "comprehensive".to_string()
}

pub async fn start_harvest_analyze(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<WechatHarvestRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .task_service
        .create_task(&identity.source, &identity.source_id, "harvest_content")
        .await?;
    let task_id = task.id;
    let gate = gate_for(&state, &identity, task_id);
    let task_store = state.task_service.store().clone();
    let mode = harvest_analyze::AnalysisMode::parse(&req.analysis_mode);

    state
        .task_service
        .spawn(task_id, harvest_analyze::run(task_store, gate, state.analyst_llm.clone(), task_id, req.urls, mode));

    Ok(envelope(json!({ "task_id": task_id })))
}

pub async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let task = state
        .task_service
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::Validation(format!("task not found: {id}")))?;
    Ok(envelope(task.to_agent_readable()))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    offset: usize,
}

pub async fn get_task_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Value>> {
    let page = state.task_service.get_task_logs(id, query.offset).await?;
    Ok(envelope(json!({ "logs": page.logs, "has_more": page.has_more })))
}

pub async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Value>> {
    let cancelled = state.task_service.cancel_task(id).await?;
    Ok(envelope(json!({ "cancelled": cancelled })))
}

#[derive(Deserialize, Default)]
pub struct ListTasksRequest {
    source_id: Option<String>,
    status: Option<String>,
    task_type: Option<String>,
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Json(req): Json<ListTasksRequest>,
) -> ApiResult<Json<Value>> {
    let status = req
        .status
        .as_deref()
        .map(TaskStatus::from_str)
        .transpose()
        .map_err(ApiError::Validation)?;
    let filter = TaskFilter {
        source_id: req.source_id,
        status,
        task_type: req.task_type,
        limit: req.limit,
    };
    let tasks = state.task_service.list_tasks(filter).await?;
    let views: Vec<Value> = tasks.iter().map(|t| t.to_agent_readable()).collect();
    Ok(envelope(json!({ "tasks": views })))
}

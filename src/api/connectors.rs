//! `/connectors/*` handlers (spec §6): one-shot connector operations,
//! gated the same way an orchestrator's calls are, but keyed to a fresh
//! ad hoc owner token rather than a persisted [`crate::task::Task`]
//! (spec §3 LockEntry: "value = owner token (task id or random uuid)").

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Extension, Path, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connectors::ExtractResult;
use crate::error::{ApiError, ApiResult};
use crate::gate::ConnectorService;
use crate::identity::Identity;

use super::envelope;
use super::state::AppState;

fn service(state: &AppState, identity: &Identity) -> Arc<ConnectorService> {
    Arc::new(ConnectorService::new(
        state.lock_store.clone(),
        state.connector_registry.clone(),
        identity.source.clone(),
        identity.source_id.clone(),
        Uuid::new_v4(),
    ))
}

#[derive(Deserialize)]
pub struct SearchAndExtractRequest {
    platform: String,
    keywords: Vec<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn search_and_extract(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<SearchAndExtractRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let results = gate
        .search_and_extract(&req.platform, &req.keywords, req.limit)
        .await?;
    Ok(envelope(json!({ "results": results })))
}

#[derive(Deserialize)]
pub struct HarvestRequest {
    platform: String,
    creator_ids: Vec<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

pub async fn harvest(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<HarvestRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let results = gate
        .harvest_user_content(&req.platform, &req.creator_ids, req.limit)
        .await?;
    Ok(envelope(json!({ "results": results })))
}

#[derive(Deserialize)]
pub struct GetNoteDetailRequest {
    platform: String,
    urls: Vec<String>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
}

fn default_concurrency() -> usize {
    3
}

pub async fn get_note_detail(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<GetNoteDetailRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let results = gate
        .get_note_details(&req.platform, &req.urls, req.concurrency)
        .await?;
    Ok(envelope(json!({ "results": results })))
}

#[derive(Deserialize)]
pub struct PublishRequest {
    platform: String,
    content: String,
    content_type: String,
    #[serde(default)]
    images: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

pub async fn publish(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<PublishRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let result = gate
        .publish_content(&req.platform, &req.content, &req.content_type, &req.images, &req.tags)
        .await?;
    Ok(envelope(result))
}

#[derive(Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum LoginRequest {
    Cookie {
        platform: String,
        cookies: HashMap<String, String>,
    },
    Qr {
        platform: String,
        #[serde(default = "default_login_timeout")]
        timeout_secs: u64,
    },
}

fn default_login_timeout() -> u64 {
    120
}

pub async fn login(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let outcome = match req {
        LoginRequest::Cookie { platform, cookies } => gate.login_cookie(&platform, &cookies).await?,
        LoginRequest::Qr { platform, timeout_secs } => gate.login_qr(&platform, timeout_secs).await?,
    };
    Ok(envelope(outcome))
}

#[derive(Deserialize)]
pub struct LoginConfirmRequest {
    context_id: String,
}

pub async fn login_confirm(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Path(platform): Path<String>,
    Json(req): Json<LoginConfirmRequest>,
) -> ApiResult<Json<Value>> {
    let gate = service(&state, &identity);
    let confirmed = gate.login_confirm(&platform, &req.context_id).await?;
    Ok(envelope(json!({ "confirmed": confirmed })))
}

#[derive(Serialize)]
pub struct PlatformInfo {
    platform: &'static str,
    capabilities: crate::connectors::CapabilitySet,
}

pub async fn platforms(State(state): State<AppState>) -> Json<Value> {
    let infos: Vec<PlatformInfo> = state
        .connector_registry
        .platforms()
        .into_iter()
        .map(|(platform, capabilities)| PlatformInfo { platform, capabilities })
        .collect();
    envelope(infos)
}

#[derive(Deserialize)]
pub struct ExtractSummaryRequest {
    platform: String,
    urls: Vec<String>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
}

/// Drives the SSE frame sequence for [`extract_summary`]: `start`, one
/// `result` per completed url, then `complete`. Holding `gate` in every
/// state keeps its held lock alive for the whole stream; `Complete`
/// releases it synchronously via `release_all_locks` once the stream is
/// fully drained (spec §9 "Streaming with backpressure").
enum StreamState {
    Start {
        gate: Arc<ConnectorService>,
        receiver: mpsc::Receiver<ExtractResult>,
        platform: String,
        total: usize,
    },
    Streaming {
        gate: Arc<ConnectorService>,
        receiver: mpsc::Receiver<ExtractResult>,
        total: usize,
        current: usize,
        success_count: usize,
    },
    Complete {
        gate: Arc<ConnectorService>,
        total: usize,
        success_count: usize,
    },
}

fn advance(state: StreamState) -> impl std::future::Future<Output = Option<(Result<Event, Infallible>, StreamState)>> {
    async move {
        match state {
            StreamState::Start {
                gate,
                receiver,
                platform,
                total,
            } => {
                let event = Event::default()
                    .event("start")
                    .data(json!({ "platform": platform, "total": total }).to_string());
                Some((
                    Ok(event),
                    StreamState::Streaming {
                        gate,
                        receiver,
                        total,
                        current: 0,
                        success_count: 0,
                    },
                ))
            }
            StreamState::Streaming {
                gate,
                mut receiver,
                total,
                current,
                success_count,
            } => match receiver.recv().await {
                Some(result) => {
                    let current = current + 1;
                    let success_count = success_count + result.success as usize;
                    let event = Event::default().event("result").data(
                        json!({
                            "result": result,
                            "current": current,
                            "total": total,
                            "success_count": success_count,
                        })
                        .to_string(),
                    );
                    Some((
                        Ok(event),
                        StreamState::Streaming {
                            gate,
                            receiver,
                            total,
                            current,
                            success_count,
                        },
                    ))
                }
                None => {
                    let event = Event::default()
                        .event("complete")
                        .data(json!({ "total": total, "success_count": success_count }).to_string());
                    Some((Ok(event), StreamState::Complete { gate, total, success_count }))
                }
            },
            StreamState::Complete { gate, .. } => {
                gate.release_all_locks().await;
                None
            }
        }
    }
}

/// SSE streaming extraction (spec §9 "Streaming with backpressure"):
/// emits one `result` event per completed URL as it arrives, then a
/// final `complete` event once the connector has torn its session down.
pub async fn extract_summary(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Json(req): Json<ExtractSummaryRequest>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let gate = service(&state, &identity);
    let total = req.urls.len();
    let platform = req.platform.clone();
    let receiver = gate
        .get_note_details_stream(&req.platform, &req.urls, req.concurrency)
        .await?;

    let stream = futures::stream::unfold(
        StreamState::Start {
            gate,
            receiver,
            platform,
            total,
        },
        advance,
    );

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

pub async fn cleanup_locks(State(state): State<AppState>, Extension(identity): Extension<Identity>) -> Json<Value> {
    let gate = service(&state, &identity);
    let count = gate.cleanup_all_locks().await;
    envelope(json!({ "cleaned": count }))
}

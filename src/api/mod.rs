//! HTTP surface (spec §2 component I, spec §6): thin handlers mapping
//! requests to [`crate::gate::ConnectorService`] or an orchestrator,
//! wrapped in the bearer-auth filter (spec §2 component J) and the
//! `{code, message, data}` response envelope (spec §6 "Response
//! envelope").

pub mod connectors;
pub mod sniper;
pub mod state;

use axum::Json;
use axum::routing::{get, post};
use axum::{Router, middleware};
use serde::Serialize;
use serde_json::{Value, json};

pub use state::AppState;

/// Wraps a successful handler result in the envelope spec §6 mandates
/// for every response: `code=0` on success.
pub fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "code": 0,
        "message": "ok",
        "data": data,
    }))
}

async fn health() -> Json<Value> {
    envelope(json!({ "status": "ok" }))
}

/// Builds the full axum router (spec §6's HTTP table), with the auth
/// filter applied to every route except `/health`.
pub fn router(state: AppState) -> Router {
    let identity_store = state.identity_store.clone();

    let authed = Router::new()
        .route("/connectors/extract-summary", post(connectors::extract_summary))
        .route("/connectors/harvest", post(connectors::harvest))
        .route("/connectors/get-note-detail", post(connectors::get_note_detail))
        .route("/connectors/search-and-extract", post(connectors::search_and_extract))
        .route("/connectors/publish", post(connectors::publish))
        .route("/connectors/login", post(connectors::login))
        .route("/connectors/login/{platform}/confirm", post(connectors::login_confirm))
        .route("/connectors/platforms", get(connectors::platforms))
        .route("/connectors/admin/cleanup-locks", post(connectors::cleanup_locks))
        .route("/sniper/xhs/harvest", post(sniper::start_creator_monitor))
        .route("/sniper/xhs/trend", post(sniper::start_trend_analysis))
        .route("/sniper/wechat/harvest", post(sniper::start_harvest_analyze))
        .route("/sniper/task/{id}", get(sniper::get_task))
        .route("/sniper/task/{id}/logs", get(sniper::get_task_logs))
        .route("/sniper/task/{id}/cancel", post(sniper::cancel_task))
        .route("/sniper/tasks", post(sniper::list_tasks))
        .route_layer(middleware::from_fn_with_state(identity_store, crate::identity::require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .with_state(state)
}

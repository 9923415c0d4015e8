//! Shared state handed to every axum handler (spec §2 component I).

use std::sync::Arc;

use crate::gate::ConnectorRegistry;
use crate::identity::IdentityStore;
use crate::llm::SharedLlm;
use crate::store::LockStore;
use crate::task::TaskService;

#[derive(Clone)]
pub struct AppState {
    pub task_service: Arc<TaskService>,
    pub lock_store: Arc<dyn LockStore>,
    pub connector_registry: ConnectorRegistry,
    pub identity_store: Arc<dyn IdentityStore>,
    pub planner_llm: SharedLlm,
    pub analyst_llm: SharedLlm,
}

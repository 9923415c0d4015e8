//! Multi-tenant content-harvesting orchestrator.
//!
//! Drives headless browser sessions against third-party content platforms,
//! gating every outbound operation behind a distributed lock and rate limit,
//! and tracking long-running work as resumable [`task::Task`]s with
//! structured step logs.

pub mod api;
pub mod config;
pub mod connectors;
pub mod error;
pub mod gate;
pub mod identity;
pub mod llm;
pub mod orchestrators;
pub mod pagedriver;
pub mod remote_browser;
pub mod store;
pub mod sweeper;
pub mod task;

pub use error::{ApiError, ApiResult};

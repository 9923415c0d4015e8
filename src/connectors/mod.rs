//! Platform connectors (spec §4.E): one adapter per content platform,
//! sharing a single extraction contract. Platform-specific logic lives in
//! how each connector builds URLs, navigates, and extracts; the
//! operation shape (context → session → fan-out → session teardown) is
//! common and lives in [`common`].
//!
//! Grounded on `original_source/services/sniper/connectors/base.py`
//! (`BaseConnector`) for the shared operation shape, and on
//! `xiaohongshu.py`/`wechat.py`/`douyin.py` for the three concrete
//! connectors in their respective submodules.

pub mod common;
pub mod feed_stream;
pub mod messaging_article;
pub mod short_video_social;
pub mod video_sharing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pagedriver::PageDriverError;
use crate::remote_browser::BrowserClientError;

#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("platform login missing")]
    ContextNotFound,

    /// Distinct from [`ConnectorError::ContextNotFound`]: the context
    /// exists but a fresh login attempt against it failed, so the caller
    /// needs `resource_url` to drive the user back through login rather
    /// than just retrying.
    #[error("platform login required")]
    NotLoggedIn { context_id: String, resource_url: String },

    #[error(transparent)]
    Browser(#[from] BrowserClientError),

    #[error(transparent)]
    Page(#[from] PageDriverError),

    #[error("{platform} does not support {operation}")]
    NotImplemented { platform: String, operation: String },

    #[error("connector error: {0}")]
    Other(String),
}

/// One item's extraction outcome in a fan-out batch (spec §4.E.i step 5:
/// "Failures in one worker MUST NOT abort siblings; they are reported
/// per-item").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResult {
    pub url: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl ExtractResult {
    pub fn ok(url: impl Into<String>, data: Value) -> Self {
        Self {
            url: url.into(),
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(url: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Outcome of a login attempt (spec §4.E.iv).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginOutcome {
    pub is_logged_in: bool,
    pub context_id: String,
    pub qrcode: Option<String>,
    pub timeout: Option<u64>,
}

/// Declares which of the common operations a connector implements (spec
/// §9 "Connector polymorphism"). The dispatcher in [`crate::gate`] uses
/// this to return `NotImplemented` instead of calling a method that
/// would panic or no-op.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CapabilitySet {
    pub search: bool,
    pub harvest: bool,
    pub get_detail: bool,
    pub publish: bool,
    pub login_cookie: bool,
    pub login_qr: bool,
}

/// Common interface every platform connector implements (spec §4.E).
/// Platform tag (used in `context_id` construction) is returned by
/// [`Connector::platform_tag`].
#[async_trait]
pub trait Connector: Send + Sync {
    fn platform_tag(&self) -> &'static str;

    fn capabilities(&self) -> CapabilitySet;

    async fn search_and_extract(
        &self,
        source: &str,
        source_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ExtractResult>, ConnectorError> {
        let _ = (source, source_id, keywords, limit);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "search_and_extract".to_string(),
        })
    }

    async fn harvest_user_content(
        &self,
        source: &str,
        source_id: &str,
        creator_ids: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ExtractResult>>, ConnectorError> {
        let _ = (source, source_id, creator_ids, limit);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "harvest_user_content".to_string(),
        })
    }

    async fn get_note_detail(
        &self,
        source: &str,
        source_id: &str,
        urls: &[String],
        concurrency: usize,
    ) -> Result<Vec<ExtractResult>, ConnectorError> {
        let _ = (source, source_id, urls, concurrency);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "get_note_detail".to_string(),
        })
    }

    /// Streaming variant of [`Connector::get_note_detail`] used by the SSE
    /// surface (spec §9 "Streaming with backpressure"): the default
    /// implementation runs the batch fetch and forwards every result into
    /// a channel sized to hold them all, so it never blocks — connectors
    /// for which incremental delivery matters can override this to push
    /// results as each one completes instead.
    async fn get_note_detail_stream(
        &self,
        source: &str,
        source_id: &str,
        urls: &[String],
        concurrency: usize,
    ) -> Result<mpsc::Receiver<ExtractResult>, ConnectorError> {
        let results = self.get_note_detail(source, source_id, urls, concurrency).await?;
        let (tx, rx) = mpsc::channel(results.len().max(1));
        for result in results {
            let _ = tx.send(result).await;
        }
        Ok(rx)
    }

    async fn publish_content(
        &self,
        source: &str,
        source_id: &str,
        content: &str,
        content_type: &str,
        images: &[String],
        tags: &[String],
    ) -> Result<Value, ConnectorError> {
        let _ = (source, source_id, content, content_type, images, tags);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "publish_content".to_string(),
        })
    }

    async fn login_cookie(
        &self,
        source: &str,
        source_id: &str,
        cookies: &HashMap<String, String>,
    ) -> Result<LoginOutcome, ConnectorError> {
        let _ = (source, source_id, cookies);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "login_cookie".to_string(),
        })
    }

    async fn login_qr(
        &self,
        source: &str,
        source_id: &str,
        timeout_secs: u64,
    ) -> Result<LoginOutcome, ConnectorError> {
        let _ = (source, source_id, timeout_secs);
        Err(ConnectorError::NotImplemented {
            platform: self.platform_tag().to_string(),
            operation: "login_qr".to_string(),
        })
    }

    /// Looks up the pending QR `LoginTask`, if any, and flushes the
    /// session back to its context (spec §4.E.iv "Login confirmation").
    async fn login_confirm(&self, context_id: &str) -> Result<bool, ConnectorError> {
        let _ = context_id;
        Ok(false)
    }

    /// Flushes every `LoginTask` past its deadline exactly as
    /// `login_confirm` would (spec §4.E.iv: "if the background timer
    /// expires first, it performs the same sync_context=true delete").
    /// Connectors with no login surface leave this as a no-op.
    async fn sweep_expired_logins(&self) {}
}

pub type SharedConnector = Arc<dyn Connector>;

//! Remote browser client (spec §4.C): a thin adapter over an external
//! browser-as-a-service provider — create/destroy session, attach CDP,
//! persist/load named contexts.
//!
//! Grounded on `original_source/services/sniper/connectors/base.py`
//! (`_get_session`, `BrowserOption`/`BrowserFingerprint` construction) and
//! `xiaohongshu.py`'s `_connect_cdp`/`_cleanup_resources`. The interface is
//! deliberately narrow (spec §4.C, last paragraph) so it can be stubbed in
//! tests — see [`FakeBrowserClient`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum BrowserClientError {
    #[error("failed to create remote browser session: {0}")]
    SessionCreation(String),
    #[error("failed to initialize remote browser: {0}")]
    BrowserInit(String),
    #[error("context not found: {0}")]
    ContextNotFound(String),
    #[error("remote browser provider transport error: {0}")]
    Transport(String),
}

/// `context_id = "{platform-tag}-context:{source}-{source_id}"` (spec §3,
/// §6 "Context id format").
pub fn context_id(platform_tag: &str, source: &str, source_id: &str) -> String {
    format!("{platform_tag}-context:{source}-{source_id}")
}

/// Persistent, named cookie+storage profile (spec §3 BrowserContext).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub name: String,
}

/// Ephemeral browser-as-a-service handle (spec §3 Session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub context_id: Option<String>,
    endpoint_url: String,
    resource_url: String,
}

impl Session {
    /// CDP endpoint URL for attachment (spec §4.C `session.endpoint_url()`).
    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }

    /// User-facing viewer URL, used to show QR login to the end user
    /// (spec §4.C `session.resource_url()`).
    pub fn resource_url(&self) -> &str {
        &self.resource_url
    }
}

/// Browser fingerprint + stealth configuration (spec §4.C
/// `session.initialize(options)`).
#[derive(Debug, Clone)]
pub struct FingerprintOptions {
    pub screen: (u32, u32),
    pub device_classes: Vec<String>,
    pub operating_systems: Vec<String>,
    pub locales: Vec<String>,
    pub use_stealth: bool,
    pub solve_captchas: bool,
}

impl Default for FingerprintOptions {
    fn default() -> Self {
        Self {
            screen: (1920, 1080),
            device_classes: vec!["desktop".to_string()],
            operating_systems: vec!["windows".to_string()],
            locales: vec!["zh-CN".to_string()],
            use_stealth: true,
            solve_captchas: true,
        }
    }
}

impl FingerprintOptions {
    pub fn with_locales(locales: Vec<String>) -> Self {
        Self {
            locales,
            ..Default::default()
        }
    }
}

/// Contract onto the external headless-browser service (spec §4.C).
#[async_trait]
pub trait BrowserClient: Send + Sync {
    /// Idempotent handle to a named persistent profile.
    async fn context_get(&self, name: &str, create_if_missing: bool) -> Result<Context, BrowserClientError>;

    /// Allocates a fresh browser bound to `context` (or unbound, if `None`).
    async fn session_create(&self, context: Option<&Context>) -> Result<Session, BrowserClientError>;

    /// Configures fingerprint/stealth/captcha handling; `false` on
    /// provider-side initialization failure.
    async fn session_initialize(
        &self,
        session: &Session,
        options: &FingerprintOptions,
    ) -> Result<bool, BrowserClientError>;

    /// Releases the session; if `sync_context` is set the mutated
    /// cookies/storage are flushed back to the bound context.
    async fn session_delete(&self, session: &Session, sync_context: bool) -> Result<bool, BrowserClientError>;

    /// LLM-driven navigation over the running browser.
    async fn agent_navigate(&self, session: &Session, url: &str) -> Result<(), BrowserClientError>;

    /// LLM-driven action (click/type/publish-flow), e.g. publish content
    /// or dismiss a login modal.
    async fn agent_act(&self, session: &Session, instruction: &str) -> Result<bool, BrowserClientError>;

    /// LLM-driven structured extraction against `schema`.
    async fn agent_extract(
        &self,
        session: &Session,
        instruction: &str,
        schema: &Value,
    ) -> Result<Value, BrowserClientError>;

    async fn agent_screenshot(&self, session: &Session) -> Result<Vec<u8>, BrowserClientError>;

    /// Attaches to `session`'s CDP endpoint, returning a page-level
    /// handle (spec §4.D). Kept on this trait rather than called
    /// directly by connectors so the whole remote-browser boundary —
    /// session lifecycle and CDP attach alike — is stubbable in tests
    /// (spec §4.C, last paragraph).
    async fn attach(&self, session: &Session) -> Result<Box<dyn crate::pagedriver::PageSessionHandle>, BrowserClientError>;
}

/// HTTP adapter over the real provider. Request/response shapes are
/// provider-specific and intentionally left as opaque JSON passthrough —
/// spec §1 Non-goals disclaim "does not mandate a specific remote-browser
/// vendor".
pub struct RemoteBrowserClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RemoteBrowserClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }
}

#[async_trait]
impl BrowserClient for RemoteBrowserClient {
    async fn context_get(&self, name: &str, create_if_missing: bool) -> Result<Context, BrowserClientError> {
        let resp = self
            .authed(self.http.post(self.url("/contexts/get")))
            .json(&serde_json::json!({"name": name, "create": create_if_missing}))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BrowserClientError::ContextNotFound(name.to_string()));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(Context {
            id: body["id"].as_str().unwrap_or(name).to_string(),
            name: name.to_string(),
        })
    }

    async fn session_create(&self, context: Option<&Context>) -> Result<Session, BrowserClientError> {
        let resp = self
            .authed(self.http.post(self.url("/sessions")))
            .json(&serde_json::json!({
                "image_id": "browser_latest",
                "context_id": context.map(|c| c.id.clone()),
            }))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(BrowserClientError::SessionCreation(format!(
                "provider returned {}",
                resp.status()
            )));
        }
        let body: Value = resp
            .json()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(Session {
            id: body["id"].as_str().unwrap_or_default().to_string(),
            context_id: context.map(|c| c.id.clone()),
            endpoint_url: body["endpoint_url"].as_str().unwrap_or_default().to_string(),
            resource_url: body["resource_url"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn session_initialize(
        &self,
        session: &Session,
        options: &FingerprintOptions,
    ) -> Result<bool, BrowserClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/sessions/{}/initialize", session.id))))
            .json(&serde_json::json!({
                "screen": {"width": options.screen.0, "height": options.screen.1},
                "devices": options.device_classes,
                "operating_systems": options.operating_systems,
                "locales": options.locales,
                "use_stealth": options.use_stealth,
                "solve_captchas": options.solve_captchas,
            }))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn session_delete(&self, session: &Session, sync_context: bool) -> Result<bool, BrowserClientError> {
        let resp = self
            .authed(self.http.delete(self.url(&format!("/sessions/{}", session.id))))
            .json(&serde_json::json!({"sync_context": sync_context}))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn agent_navigate(&self, session: &Session, url: &str) -> Result<(), BrowserClientError> {
        self.authed(self.http.post(self.url(&format!("/sessions/{}/agent/navigate", session.id))))
            .json(&serde_json::json!({"url": url}))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn agent_act(&self, session: &Session, instruction: &str) -> Result<bool, BrowserClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/sessions/{}/agent/act", session.id))))
            .json(&serde_json::json!({"action": instruction}))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(resp.status().is_success())
    }

    async fn agent_extract(
        &self,
        session: &Session,
        instruction: &str,
        schema: &Value,
    ) -> Result<Value, BrowserClientError> {
        let resp = self
            .authed(self.http.post(self.url(&format!("/sessions/{}/agent/extract", session.id))))
            .json(&serde_json::json!({"instruction": instruction, "schema": schema}))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        resp.json().await.map_err(|e| BrowserClientError::Transport(e.to_string()))
    }

    async fn agent_screenshot(&self, session: &Session) -> Result<Vec<u8>, BrowserClientError> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/sessions/{}/agent/screenshot", session.id))))
            .send()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(resp
            .bytes()
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?
            .to_vec())
    }

    async fn attach(&self, session: &Session) -> Result<Box<dyn crate::pagedriver::PageSessionHandle>, BrowserClientError> {
        let page_session = crate::pagedriver::PageSession::attach(session.endpoint_url())
            .await
            .map_err(|e| BrowserClientError::Transport(e.to_string()))?;
        Ok(Box::new(page_session))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    /// Canned, deterministic [`BrowserClient`] for tests. Counts
    /// create/delete pairs so tests can assert session hygiene (spec §8
    /// property 9).
    #[derive(Clone, Default)]
    pub struct FakeBrowserClient {
        contexts: Arc<Mutex<std::collections::HashSet<String>>>,
        pub sessions_created: Arc<AtomicUsize>,
        pub sessions_deleted: Arc<AtomicUsize>,
        pub logged_in_contexts: Arc<Mutex<std::collections::HashSet<String>>>,
    }

    impl FakeBrowserClient {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn mark_logged_in(&self, context_id: &str) {
            self.logged_in_contexts.lock().insert(context_id.to_string());
        }

        pub fn live_sessions(&self) -> usize {
            self.sessions_created.load(Ordering::SeqCst) - self.sessions_deleted.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BrowserClient for FakeBrowserClient {
        async fn context_get(&self, name: &str, create_if_missing: bool) -> Result<Context, BrowserClientError> {
            let mut contexts = self.contexts.lock();
            if !contexts.contains(name) {
                if !create_if_missing {
                    return Err(BrowserClientError::ContextNotFound(name.to_string()));
                }
                contexts.insert(name.to_string());
            }
            Ok(Context {
                id: name.to_string(),
                name: name.to_string(),
            })
        }

        async fn session_create(&self, context: Option<&Context>) -> Result<Session, BrowserClientError> {
            let id = uuid::Uuid::new_v4().to_string();
            self.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(Session {
                id: id.clone(),
                context_id: context.map(|c| c.id.clone()),
                endpoint_url: format!("ws://fake-provider/cdp/{id}"),
                resource_url: format!("https://fake-provider/viewer/{id}"),
            })
        }

        async fn session_initialize(
            &self,
            _session: &Session,
            _options: &FingerprintOptions,
        ) -> Result<bool, BrowserClientError> {
            Ok(true)
        }

        async fn session_delete(&self, _session: &Session, _sync_context: bool) -> Result<bool, BrowserClientError> {
            self.sessions_deleted.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }

        async fn agent_navigate(&self, _session: &Session, _url: &str) -> Result<(), BrowserClientError> {
            Ok(())
        }

        async fn agent_act(&self, _session: &Session, _instruction: &str) -> Result<bool, BrowserClientError> {
            Ok(true)
        }

        async fn agent_extract(
            &self,
            _session: &Session,
            _instruction: &str,
            _schema: &Value,
        ) -> Result<Value, BrowserClientError> {
            Ok(Value::Null)
        }

        async fn agent_screenshot(&self, _session: &Session) -> Result<Vec<u8>, BrowserClientError> {
            Ok(Vec::new())
        }

        async fn attach(&self, _session: &Session) -> Result<Box<dyn crate::pagedriver::PageSessionHandle>, BrowserClientError> {
            Ok(Box::new(crate::pagedriver::fake::FakePageSession))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBrowserClient;
    use super::*;

    #[tokio::test]
    async fn context_get_without_create_fails_when_missing() {
        let client = FakeBrowserClient::new();
        let err = client.context_get("platform-context:a-b", false).await.unwrap_err();
        assert!(matches!(err, BrowserClientError::ContextNotFound(_)));
    }

    #[tokio::test]
    async fn session_create_then_delete_balances_counter() {
        let client = FakeBrowserClient::new();
        let ctx = client.context_get("platform-context:a-b", true).await.unwrap();
        let session = client.session_create(Some(&ctx)).await.unwrap();
        assert_eq!(client.live_sessions(), 1);
        client.session_delete(&session, true).await.unwrap();
        assert_eq!(client.live_sessions(), 0);
    }
}

//! Auth filter (spec §2 component J): validates the bearer credential on
//! every HTTP request against an external identity store and attaches the
//! resolved `(source, source_id)` tenant pair to the request, the way
//! every orchestrator/connector call downstream is keyed (spec §3
//! "Source / source_id ... carried on every request after auth").
//!
//! Grounded on the teacher's own middleware-as-tower-layer style
//! (`browser/mod.rs`'s CDP attach gate is the closest analogue in this
//! codebase to "reject before doing real work"); the identity store
//! itself is an external collaborator per spec §1 scope ("credential/API-key
//! CRUD" is explicitly out of scope) — this module only calls it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ApiError;

#[derive(Error, Debug, Clone)]
pub enum IdentityError {
    #[error("invalid or expired api key")]
    Invalid,
    #[error("identity store transport error: {0}")]
    Transport(String),
}

/// Resolved tenant identity, attached to the request via an `Extension`
/// by [`require_auth`] and read back out by every `/connectors/*` and
/// `/sniper/*` handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub source: String,
    pub source_id: String,
}

/// Contract onto the external identity store (spec §1 "credential/API-key
/// CRUD" is out of scope; this is the narrow read-only interface the core
/// needs against it).
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn validate(&self, api_key: &str) -> Result<Identity, IdentityError>;
}

/// HTTP adapter over the real identity store. Request/response shape is
/// store-specific and left as opaque JSON passthrough, matching
/// [`crate::remote_browser::RemoteBrowserClient`]'s own stance on its
/// external provider.
pub struct HttpIdentityStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl IdentityStore for HttpIdentityStore {
    async fn validate(&self, api_key: &str) -> Result<Identity, IdentityError> {
        let resp = self
            .http
            .get(format!("{}/api-keys/validate", self.base_url.trim_end_matches('/')))
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED || resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(IdentityError::Invalid);
        }
        if !resp.status().is_success() {
            return Err(IdentityError::Transport(format!("identity store returned {}", resp.status())));
        }
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| IdentityError::Transport(e.to_string()))?;
        let source = body["source"].as_str().ok_or(IdentityError::Invalid)?.to_string();
        let source_id = body["source_id"].as_str().ok_or(IdentityError::Invalid)?.to_string();
        Ok(Identity { source, source_id })
    }
}

/// Axum middleware (spec §6 "Authorization: Bearer <api_key>" on every
/// route): extracts the bearer token, validates it, and inserts the
/// resolved [`Identity`] into the request's extensions for downstream
/// handlers to pull out via `Extension<Identity>`.
pub async fn require_auth(
    State(store): State<Arc<dyn IdentityStore>>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?
        .to_string();

    let identity = store.validate(&api_key).await.map_err(|err| match err {
        IdentityError::Invalid => ApiError::Unauthorized,
        IdentityError::Transport(msg) => {
            tracing::error!(error = %msg, "identity store unreachable");
            ApiError::Unauthorized
        }
    })?;

    req.extensions_mut().insert(identity);
    Ok(next.run(req).await)
}

#[cfg(test)]
pub mod fake {
    use super::*;

    /// Canned [`IdentityStore`] for HTTP-layer tests: accepts exactly one
    /// configured key, rejects everything else.
    pub struct FakeIdentityStore {
        pub valid_key: String,
        pub identity: Identity,
    }

    impl FakeIdentityStore {
        pub fn new(valid_key: impl Into<String>, source: impl Into<String>, source_id: impl Into<String>) -> Self {
            Self {
                valid_key: valid_key.into(),
                identity: Identity {
                    source: source.into(),
                    source_id: source_id.into(),
                },
            }
        }
    }

    #[async_trait]
    impl IdentityStore for FakeIdentityStore {
        async fn validate(&self, api_key: &str) -> Result<Identity, IdentityError> {
            if api_key == self.valid_key {
                Ok(self.identity.clone())
            } else {
                Err(IdentityError::Invalid)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeIdentityStore;
    use super::*;

    #[tokio::test]
    async fn valid_key_resolves_identity() {
        let store = FakeIdentityStore::new("secret", "tenant-a", "user-1");
        let identity = store.validate("secret").await.unwrap();
        assert_eq!(identity.source, "tenant-a");
        assert_eq!(identity.source_id, "user-1");
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let store = FakeIdentityStore::new("secret", "tenant-a", "user-1");
        assert!(matches!(store.validate("wrong").await, Err(IdentityError::Invalid)));
    }
}

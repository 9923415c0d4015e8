//! External LLM agent boundary (spec §9 "External LLM agent boundary"):
//! a narrow `run(prompt) -> text` contract. The core does not depend on
//! any particular model or agent framework; orchestrators in
//! [`crate::orchestrators`] call through this trait for keyword
//! expansion and the final analysis/report generation step.
//!
//! Grounded on `original_source/services/sniper/agent/xhs_trend.py` and
//! `wechat_analyze.py`, both of which wrap an `agno::Agent::arun(prompt)
//! -> response.content` call; this trait is that call's signature with
//! the framework erased, per spec's own framing ("implementations can
//! stub these for testing").

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("llm call failed: {0}")]
    Failed(String),
}

/// A single named language model invocation point. Orchestrators hold
/// one `Arc<dyn Llm>` per role they need (e.g. a cheap "planner" for
/// keyword expansion, a stronger "analyst" for the final report),
/// mirroring the source's two-model split (`reasoning_model`/`chat_model`
/// in `xhs_trend.py`).
#[async_trait]
pub trait Llm: Send + Sync {
    async fn run(&self, prompt: &str) -> Result<String, LlmError>;
}

pub type SharedLlm = std::sync::Arc<dyn Llm>;

/// HTTP adapter over an external LLM-serving endpoint, used when no
/// in-process agent framework is wired in. POSTs `{"prompt": ...}` and
/// expects `{"text": ...}` back — the same opaque-JSON-passthrough stance
/// [`crate::remote_browser::RemoteBrowserClient`] takes with its own
/// external provider, since the LLM framework itself is out of scope
/// (spec §1 Non-goals).
pub struct HttpLlm {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpLlm {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl Llm for HttpLlm {
    async fn run(&self, prompt: &str) -> Result<String, LlmError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&serde_json::json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| LlmError::Failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(LlmError::Failed(format!("llm endpoint returned {}", response.status())));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LlmError::Failed(e.to_string()))?;
        body["text"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LlmError::Failed("llm response missing \"text\" field".to_string()))
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Canned [`Llm`] for orchestrator tests: returns a fixed response,
    /// or echoes the prompt back if none is configured, and records every
    /// prompt it was given so tests can assert on prompt construction.
    #[derive(Clone, Default)]
    pub struct FakeLlm {
        pub response: Option<String>,
        pub prompts: Arc<Mutex<Vec<String>>>,
    }

    impl FakeLlm {
        pub fn with_response(response: impl Into<String>) -> Self {
            Self {
                response: Some(response.into()),
                prompts: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().clone()
        }
    }

    #[async_trait]
    impl Llm for FakeLlm {
        async fn run(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().push(prompt.to_string());
            Ok(self.response.clone().unwrap_or_else(|| prompt.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLlm;
    use super::*;

    #[tokio::test]
    async fn fake_llm_records_prompts_and_returns_canned_response() {
        let llm = FakeLlm::with_response("core, scene, pain-point");
        let out = llm.run("expand keyword: skincare").await.unwrap();
        assert_eq!(out, "core, scene, pain-point");
        assert_eq!(llm.prompts(), vec!["expand keyword: skincare".to_string()]);
    }
}

//! Process-wide configuration, loaded once from the environment.

use std::env;
use std::sync::OnceLock;
use std::time::Duration;

static SETTINGS: OnceLock<Settings> = OnceLock::new();

/// Default task timeout, matched against `spec.md` §4.G (the sweeper's
/// per-task deadline when a task carries no explicit override).
const DEFAULT_TASK_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Redis connection string backing the lock & rate store.
    pub redis_url: String,
    /// API key for the remote browser-as-a-service provider.
    pub browser_provider_api_key: String,
    /// Base URL for the remote browser-as-a-service provider's REST API.
    pub browser_provider_base_url: String,
    /// Bind address for the HTTP surface.
    pub http_bind_addr: String,
    /// Default task timeout (spec §4.G), overridable per task type.
    pub task_timeout: Duration,
    /// Base URL of the external identity store used by the auth filter.
    pub identity_store_url: String,
    /// Base URL of the video-sharing platform's public feed endpoint,
    /// consumed by [`crate::connectors::video_sharing`] via `feed_stream`.
    pub video_feed_base_url: String,
    /// Base URL of the LLM agent runner backing [`crate::llm::HttpLlm`]
    /// (spec §9 "External LLM agent boundary" — a narrow `run(prompt)`
    /// endpoint, role selected by path suffix in `main.rs`).
    pub llm_base_url: String,
}

impl Settings {
    fn from_env() -> Self {
        Self {
            redis_url: env_or("HARVESTER_REDIS_URL", "redis://127.0.0.1:6379"),
            browser_provider_api_key: env_or("HARVESTER_BROWSER_API_KEY", ""),
            browser_provider_base_url: env_or(
                "HARVESTER_BROWSER_BASE_URL",
                "https://api.browser-provider.example",
            ),
            http_bind_addr: env_or("HARVESTER_HTTP_BIND", "0.0.0.0:8080"),
            task_timeout: Duration::from_secs(env_u64(
                "HARVESTER_TASK_TIMEOUT_SECS",
                DEFAULT_TASK_TIMEOUT_SECS,
            )),
            identity_store_url: env_or(
                "HARVESTER_IDENTITY_STORE_URL",
                "https://identity.example.internal",
            ),
            video_feed_base_url: env_or(
                "HARVESTER_VIDEO_FEED_BASE_URL",
                "https://www.douyin.com/aweme/v1/web/general/search/single",
            ),
            llm_base_url: env_or("HARVESTER_LLM_BASE_URL", "https://llm-agent.example.internal"),
        }
    }

    /// Process-wide singleton. First caller initializes from the
    /// environment; later callers get the same instance.
    pub fn global() -> &'static Settings {
        SETTINGS.get_or_init(Settings::from_env)
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

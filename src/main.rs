//! Binary entry point: wires the ambient stack (config, logging, stores,
//! remote-browser client, connector registry, LLM adapters) into the
//! axum HTTP surface (spec §2 component I) and starts the background
//! task-timeout sweeper (spec §4.G) and login-task expiry sweep
//! alongside it.

use std::sync::Arc;

use content_harvester::api::{self, AppState};
use content_harvester::config::Settings;
use content_harvester::connectors::messaging_article::MessagingArticleConnector;
use content_harvester::connectors::short_video_social::ShortVideoSocialConnector;
use content_harvester::connectors::video_sharing::VideoSharingConnector;
use content_harvester::gate::ConnectorRegistry;
use content_harvester::identity::HttpIdentityStore;
use content_harvester::llm::HttpLlm;
use content_harvester::remote_browser::RemoteBrowserClient;
use content_harvester::store::RedisLockStore;
use content_harvester::sweeper::TaskSweeper;
use content_harvester::task::{SqliteTaskStore, TaskService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .json()
        .init();

    let settings = Settings::global();

    let lock_store: Arc<dyn content_harvester::store::LockStore> =
        Arc::new(RedisLockStore::connect(&settings.redis_url).await?);

    let task_store: Arc<dyn content_harvester::task::TaskStore> =
        Arc::new(SqliteTaskStore::open("harvester_tasks.db")?);
    let task_service = Arc::new(TaskService::new(task_store.clone()));

    let browser_client: Arc<dyn content_harvester::remote_browser::BrowserClient> = Arc::new(
        RemoteBrowserClient::new(&settings.browser_provider_base_url, &settings.browser_provider_api_key),
    );

    let connector_registry = ConnectorRegistry::new()
        .register(Arc::new(ShortVideoSocialConnector::new(browser_client.clone())))
        .register(Arc::new(MessagingArticleConnector::new(browser_client.clone())))
        .register(Arc::new(VideoSharingConnector::with_feed_base_url(
            reqwest::Client::new(),
            settings.video_feed_base_url.clone(),
        )));

    let identity_store: Arc<dyn content_harvester::identity::IdentityStore> =
        Arc::new(HttpIdentityStore::new(&settings.identity_store_url));

    let llm_http = reqwest::Client::new();
    let planner_llm: content_harvester::llm::SharedLlm =
        Arc::new(HttpLlm::new(llm_http.clone(), format!("{}/planner", settings.llm_base_url)));
    let analyst_llm: content_harvester::llm::SharedLlm =
        Arc::new(HttpLlm::new(llm_http, format!("{}/analyst", settings.llm_base_url)));

    let state = AppState {
        task_service: task_service.clone(),
        lock_store: lock_store.clone(),
        connector_registry: connector_registry.clone(),
        identity_store,
        planner_llm,
        analyst_llm,
    };

    let sweeper = TaskSweeper::new(lock_store.clone(), task_store.clone());
    tokio::spawn(sweeper.run());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            ticker.tick().await;
            connector_registry.sweep_expired_logins().await;
        }
    });

    let app = api::router(state);
    let listener = tokio::net::TcpListener::bind(&settings.http_bind_addr).await?;
    tracing::info!(addr = %settings.http_bind_addr, "content-harvester listening");
    axum::serve(listener, app).await?;

    Ok(())
}

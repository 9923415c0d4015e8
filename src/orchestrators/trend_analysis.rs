//! Trend-analysis orchestrator (spec §2 "trend analysis" workflow),
//! grounded on `original_source/services/sniper/agent/xhs_trend.py`'s
//! `XiaohongshuTrendAgent.execute`.
//!
//! Flow: login precheck -> keyword expansion (planner LLM) -> search +
//! dedup + top-10 by engagement -> batched detail fetch -> analyst LLM
//! call over the assembled context -> `Task::complete`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::config::Settings;
use crate::connectors::ExtractResult;
use crate::gate::{ConnectorService, run_scoped};
use crate::llm::SharedLlm;
use crate::task::TaskStore;

use super::status_output;

const PLATFORM: &str = "short-video-social";
const SEARCH_LIMIT: usize = 30;
const TOP_N: usize = 10;
const DETAIL_CONCURRENCY: usize = 2;

/// Runs one trend-analysis task end to end. `task_id` must already name a
/// persisted, non-terminal [`crate::task::Task`] (created by the HTTP
/// handler before spawning this).
pub async fn run(
    task_store: Arc<dyn TaskStore>,
    gate: Arc<ConnectorService>,
    planner: SharedLlm,
    analyst: SharedLlm,
    task_id: Uuid,
    core_keyword: String,
) -> anyhow::Result<()> {
    let mut task = task_store
        .get(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

    if core_keyword.trim().is_empty() {
        task.fail("no input, please provide a valid keyword and retry", Some(0));
        task_store.save(&task).await?;
        return Ok(());
    }

    task.start();
    task.log_step(
        0,
        "task initialization",
        HashMap::from([("core_keyword".to_string(), Value::String(core_keyword.clone()))]),
        HashMap::from([("task_id".to_string(), Value::String(task_id.to_string()))]),
        "completed",
    );
    task.progress = 10;
    task_store.save(&task).await?;

    run_scoped(Arc::clone(&gate), Arc::clone(&task_store), move |gate| {
        let task_store = Arc::clone(&task_store);
        async move {
            let login = gate
                .login_qr(PLATFORM, Settings::global().task_timeout.as_secs())
                .await?;
            if !login.is_logged_in {
                let mut task = load(&task_store, task_id).await?;
                task.waiting_login(serde_json::json!({
                    "platform": PLATFORM,
                    "context_id": login.context_id,
                    "resource_url": login.qrcode,
                    "timeout": login.timeout,
                }));
                task_store.save(&task).await?;
                return Ok(());
            }

            let keywords = expand_keywords(planner.as_ref(), &core_keyword).await;
            {
                let mut task = load(&task_store, task_id).await?;
                task.log_step(
                    1,
                    "keyword expansion",
                    HashMap::from([("core_keyword".to_string(), Value::String(core_keyword.clone()))]),
                    HashMap::from([(
                        "keywords".to_string(),
                        Value::Array(keywords.iter().cloned().map(Value::String).collect()),
                    )]),
                    "completed",
                );
                task.progress = 25;
                task_store.save(&task).await?;
            }

            let search_results = gate.search_and_extract(PLATFORM, &keywords, SEARCH_LIMIT).await?;
            let top_notes = dedup_and_rank(search_results);

            if top_notes.is_empty() {
                let mut task = load(&task_store, task_id).await?;
                task.fail("no valid data found", Some(task.progress));
                task_store.save(&task).await?;
                return Ok(());
            }
            {
                let mut task = load(&task_store, task_id).await?;
                task.progress = 50;
                task_store.save(&task).await?;
            }

            let urls: Vec<String> = top_notes
                .iter()
                .filter_map(|n| n.get("full_url").and_then(Value::as_str).map(str::to_string))
                .collect();
            let detail_results = gate.get_note_details(PLATFORM, &urls, DETAIL_CONCURRENCY).await?;
            let context = build_context(&top_notes, &detail_results);

            {
                let mut task = load(&task_store, task_id).await?;
                task.log_step(
                    3,
                    "fetch note details",
                    HashMap::from([("note_count".to_string(), Value::from(top_notes.len()))]),
                    status_output(format!("detail fetch complete, {} chars of context", context.len())),
                    "completed",
                );
                task.progress = 70;
                task_store.save(&task).await?;
            }

            let prompt = format!(
                "Core keyword: {core_keyword}\n\nHere is the freshly collected data:\n{context}\n\n\
                 Decode why these posts work: how the titles create anticipation or urgency, what the \
                 cover images hook on, and what pain points the comments reveal. Then propose 3 concrete \
                 content ideas. Cite the full_url of the specific note backing every claim."
            );
            let analysis = analyst.run(&prompt).await?;

            let mut task = load(&task_store, task_id).await?;
            task.log_step(
                4,
                "llm analysis",
                HashMap::from([("data_size".to_string(), Value::from(context.len()))]),
                HashMap::from([("analysis_length".to_string(), Value::from(analysis.len()))]),
                "completed",
            );
            task.complete(serde_json::json!({ "output": analysis }));
            task_store.save(&task).await?;
            Ok(())
        }
    })
    .await?;

    Ok(())
}

async fn load(task_store: &Arc<dyn TaskStore>, task_id: Uuid) -> anyhow::Result<crate::task::Task> {
    task_store
        .get(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} vanished mid-run"))
}

/// Splits the planner's comma-separated response into keywords (spec
/// framing: "核心词、场景词、痛点词" — core/scenario/pain-point), capped
/// at 3 to match the source's three-dimension fan-out.
async fn expand_keywords(planner: &dyn crate::llm::Llm, core_keyword: &str) -> Vec<String> {
    let prompt = format!(
        "Based on the core keyword \"{core_keyword}\", expand it into 3 distinct search keywords \
         covering the core term, a usage scenario, and a pain point. Return only a comma-separated \
         list of keywords, nothing else."
    );
    match planner.run(&prompt).await {
        Ok(response) => {
            let keywords: Vec<String> = response
                .replace('，', ",")
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .take(3)
                .collect();
            if keywords.is_empty() {
                vec![core_keyword.to_string()]
            } else {
                keywords
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "keyword planner failed, falling back to the core keyword alone");
            vec![core_keyword.to_string()]
        }
    }
}

/// Dedups search hits by `note_id` (falling back to `full_url`), then
/// sorts by `liked_count` descending and keeps the top [`TOP_N`].
fn dedup_and_rank(results: Vec<ExtractResult>) -> Vec<Value> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();
    for result in results.into_iter().filter(|r| r.success) {
        let Some(note) = result.data else { continue };
        let id = note
            .get("note_id")
            .and_then(Value::as_str)
            .or_else(|| note.get("full_url").and_then(Value::as_str))
            .map(str::to_string);
        if let Some(id) = id {
            if seen.insert(id) {
                unique.push(note);
            }
        }
    }
    unique.sort_by(|a, b| liked_count(b).partial_cmp(&liked_count(a)).unwrap_or(std::cmp::Ordering::Equal));
    unique.truncate(TOP_N);
    unique
}

fn liked_count(note: &Value) -> f64 {
    match note.get("liked_count") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Builds the context block the analyst LLM reads, one section per note,
/// merging the search-hit summary with its fetched detail.
fn build_context(notes: &[Value], details: &[ExtractResult]) -> String {
    let details_map: HashMap<&str, &Value> = details
        .iter()
        .filter(|d| d.success)
        .filter_map(|d| d.data.as_ref().map(|v| (d.url.as_str(), v)))
        .collect();

    let mut parts = Vec::with_capacity(notes.len());
    for (i, note) in notes.iter().enumerate() {
        let url = note.get("full_url").and_then(Value::as_str).unwrap_or("");
        let detail = details_map.get(url).copied();

        let title = detail
            .and_then(|d| d.get("title"))
            .or_else(|| note.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("untitled");
        let desc = detail.and_then(|d| d.get("desc")).and_then(Value::as_str).unwrap_or("");
        let liked = detail.map(liked_count).unwrap_or_else(|| liked_count(note));
        let collected = detail
            .and_then(|d| d.get("collected_count"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let commented = detail
            .and_then(|d| d.get("comment_count"))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let comment_str = detail
            .and_then(|d| d.get("comments"))
            .and_then(Value::as_array)
            .map(|comments| {
                comments
                    .iter()
                    .take(3)
                    .filter_map(|c| c.get("content").and_then(Value::as_str))
                    .map(|c| format!("- {}", c.chars().take(50).collect::<String>()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "no comments yet".to_string());

        parts.push(format!(
            "[Note {}]\nTitle: {title}\nLink: {url}\nEngagement: {liked} likes | {collected} saves | {commented} comments\nBody:\n{desc}\n\nTop comments:\n{comment_str}\n{}",
            i + 1,
            "=".repeat(60),
        ));
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{CapabilitySet, Connector, ConnectorError, LoginOutcome};
    use crate::gate::ConnectorRegistry;
    use crate::llm::fake::FakeLlm;
    use crate::store::FakeLockStore;
    use crate::task::InMemoryTaskStore;
    use async_trait::async_trait;

    struct StubTrendConnector;

    #[async_trait]
    impl Connector for StubTrendConnector {
        fn platform_tag(&self) -> &'static str {
            PLATFORM
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet {
                search: true,
                login_qr: true,
                ..Default::default()
            }
        }
        async fn login_qr(&self, _s: &str, _sid: &str, _timeout: u64) -> Result<LoginOutcome, ConnectorError> {
            Ok(LoginOutcome {
                is_logged_in: true,
                context_id: "ctx".to_string(),
                qrcode: None,
                timeout: None,
            })
        }
        async fn search_and_extract(
            &self,
            _s: &str,
            _sid: &str,
            _keywords: &[String],
            _limit: usize,
        ) -> Result<Vec<ExtractResult>, ConnectorError> {
            Ok(vec![
                ExtractResult::ok(
                    "n1",
                    serde_json::json!({"note_id": "n1", "full_url": "https://x/n1", "liked_count": 100, "title": "A"}),
                ),
                ExtractResult::ok(
                    "n2",
                    serde_json::json!({"note_id": "n2", "full_url": "https://x/n2", "liked_count": 500, "title": "B"}),
                ),
            ])
        }
        async fn get_note_detail(
            &self,
            _s: &str,
            _sid: &str,
            urls: &[String],
            _concurrency: usize,
        ) -> Result<Vec<ExtractResult>, ConnectorError> {
            Ok(urls
                .iter()
                .map(|u| ExtractResult::ok(u.clone(), serde_json::json!({"title": "detail", "desc": "body text"})))
                .collect())
        }
    }

    #[tokio::test]
    async fn ranks_by_liked_count_and_completes_with_analysis() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "trend_analysis").await.unwrap();

        let registry = ConnectorRegistry::new().register(Arc::new(StubTrendConnector));
        let gate = Arc::new(ConnectorService::new(
            Arc::new(FakeLockStore::new()),
            registry,
            "system",
            "u1",
            task.id,
        ));
        let planner = Arc::new(FakeLlm::with_response("skincare, night routine, acne"));
        let analyst = Arc::new(FakeLlm::with_response("final analysis text"));

        run(task_store.clone(), gate, planner, analyst, task.id, "skincare".to_string())
            .await
            .unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "completed");
        assert_eq!(loaded.result.unwrap()["output"], "final analysis text");
    }

    #[tokio::test]
    async fn empty_keyword_fails_fast_without_touching_connectors() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "trend_analysis").await.unwrap();
        let registry = ConnectorRegistry::new().register(Arc::new(StubTrendConnector));
        let gate = Arc::new(ConnectorService::new(
            Arc::new(FakeLockStore::new()),
            registry,
            "system",
            "u1",
            task.id,
        ));
        run(
            task_store.clone(),
            gate,
            Arc::new(FakeLlm::default()),
            Arc::new(FakeLlm::default()),
            task.id,
            "  ".to_string(),
        )
        .await
        .unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "failed");
    }
}

//! Harvest/analyze orchestrator for the article platform (spec §2
//! "harvest/analyze" workflow), grounded on
//! `original_source/services/sniper/agent/wechat_harvest.py` (detail
//! fetch) and `wechat_analyze.py` (the four analysis modes).
//!
//! Flow: fetch article details for the given URLs in one batched
//! fan-out -> concatenate into a single context block -> hand the block
//! to the analyst LLM under a mode-specific prompt -> `Task::complete`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::gate::{ConnectorService, run_scoped};
use crate::llm::SharedLlm;
use crate::task::TaskStore;

use super::status_output;

const PLATFORM: &str = "messaging-article";
const DETAIL_CONCURRENCY: usize = 3;

/// Analysis mode (`original_source` `wechat_analyze.py`'s four prompt
/// templates). Unrecognized values fall back to [`AnalysisMode::Comprehensive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Comprehensive,
    Quick,
    Comparison,
    Trend,
}

impl AnalysisMode {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "quick" => AnalysisMode::Quick,
            "comparison" => AnalysisMode::Comparison,
            "trend" => AnalysisMode::Trend,
            _ => AnalysisMode::Comprehensive,
        }
    }

    fn instruction(self) -> &'static str {
        match self {
            AnalysisMode::Comprehensive => {
                "Give a comprehensive analysis of each article: its core argument, supporting \
                 evidence, structure, tone, and any claims worth fact-checking."
            }
            AnalysisMode::Quick => {
                "Give a quick 3-5 bullet summary per article: what it says and why it matters. \
                 No elaboration."
            }
            AnalysisMode::Comparison => {
                "Compare the articles against each other: where they agree, where they diverge, \
                 and which makes the stronger case. Cite titles when referencing a specific piece."
            }
            AnalysisMode::Trend => {
                "Identify the common themes and trajectory across the articles as a body of work: \
                 what narrative or topic is gaining or losing emphasis over time."
            }
        }
    }
}

/// Runs one harvest/analyze task end to end. `task_id` must already name a
/// persisted, non-terminal [`crate::task::Task`].
pub async fn run(
    task_store: Arc<dyn TaskStore>,
    gate: Arc<ConnectorService>,
    analyst: SharedLlm,
    task_id: Uuid,
    urls: Vec<String>,
    analysis_mode: AnalysisMode,
) -> anyhow::Result<()> {
    let mut task = task_store
        .get(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

    if urls.is_empty() {
        task.fail("no input, please provide at least one article url and retry", Some(0));
        task_store.save(&task).await?;
        return Ok(());
    }

    task.start();
    task.log_step(
        0,
        "task initialization",
        HashMap::from([("url_count".to_string(), Value::from(urls.len()))]),
        HashMap::from([("task_id".to_string(), Value::String(task_id.to_string()))]),
        "completed",
    );
    task.progress = 10;
    task_store.save(&task).await?;

    run_scoped(Arc::clone(&gate), Arc::clone(&task_store), move |gate| {
        let task_store = Arc::clone(&task_store);
        async move {
            let details = gate.get_note_details(PLATFORM, &urls, DETAIL_CONCURRENCY).await?;
            let context = build_context(&details);

            if context.trim().is_empty() {
                let mut task = load(&task_store, task_id).await?;
                task.fail("no article content could be retrieved", Some(task.progress));
                task_store.save(&task).await?;
                return Ok(());
            }

            {
                let mut task = load(&task_store, task_id).await?;
                task.log_step(
                    1,
                    "fetch article details",
                    HashMap::from([("url_count".to_string(), Value::from(urls.len()))]),
                    status_output(format!("fetched {} char(s) of context", context.len())),
                    "completed",
                );
                task.progress = 60;
                task_store.save(&task).await?;
            }

            let prompt = format!(
                "{}\n\nHere are the harvested articles:\n{context}",
                analysis_mode.instruction()
            );
            let analysis = analyst.run(&prompt).await?;

            let mut task = load(&task_store, task_id).await?;
            task.log_step(
                2,
                "llm analysis",
                HashMap::from([("data_size".to_string(), Value::from(context.len()))]),
                HashMap::from([("analysis_length".to_string(), Value::from(analysis.len()))]),
                "completed",
            );
            task.complete(serde_json::json!({ "analysis": analysis }));
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

/// Concatenates successfully fetched article details into one context
/// block, one section per article, skipping failed fetches (spec §4.E.i
/// step 5: per-item failures don't abort the batch).
fn build_context(details: &[crate::connectors::ExtractResult]) -> String {
    let mut parts = Vec::with_capacity(details.len());
    for (i, detail) in details.iter().enumerate() {
        let Some(data) = detail.data.as_ref().filter(|_| detail.success) else {
            continue;
        };
        let title = data.get("title").and_then(Value::as_str).unwrap_or("untitled");
        let author = data.get("author").and_then(Value::as_str).unwrap_or("unknown");
        let publish_time = data.get("publish_time").and_then(Value::as_str).unwrap_or("unknown");
        let key_points = data
            .get("key_points")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|p| format!("- {p}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let body = data.get("struct").and_then(Value::as_str).unwrap_or("");

        parts.push(format!(
            "[Article {}]\nTitle: {title}\nAuthor: {author}\nPublished: {publish_time}\nLink: {}\nKey points:\n{key_points}\nSummary:\n{body}",
            i + 1,
            detail.url,
        ));
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{CapabilitySet, Connector, ConnectorError, ExtractResult};
    use crate::gate::ConnectorRegistry;
    use crate::llm::fake::FakeLlm;
    use crate::store::FakeLockStore;
    use crate::task::InMemoryTaskStore;
    use async_trait::async_trait;

    struct StubArticleConnector;

    #[async_trait]
    impl Connector for StubArticleConnector {
        fn platform_tag(&self) -> &'static str {
            PLATFORM
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet {
                get_detail: true,
                ..Default::default()
            }
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
                .enumerate()
                .map(|(i, u)| {
                    if i == 0 {
                        ExtractResult::err(u.clone(), "fetch failed")
                    } else {
                        ExtractResult::ok(
                            u.clone(),
                            serde_json::json!({
                                "title": format!("article {i}"),
                                "author": "someone",
                                "publish_time": "2026-01-01T00:00:00Z",
                                "key_points": ["point a", "point b"],
                                "struct": "full article body",
                            }),
                        )
                    }
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn skips_failed_fetches_and_completes_with_analysis() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "harvest_analyze").await.unwrap();
        let registry = ConnectorRegistry::new().register(Arc::new(StubArticleConnector));
        let gate = Arc::new(ConnectorService::new(
            Arc::new(FakeLockStore::new()),
            registry,
            "system",
            "u1",
            task.id,
        ));
        let analyst = Arc::new(FakeLlm::with_response("final analysis"));

        run(
            task_store.clone(),
            gate,
            analyst,
            task.id,
            vec!["https://a/1".to_string(), "https://a/2".to_string()],
            AnalysisMode::Comprehensive,
        )
        .await
        .unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "completed");
        assert_eq!(loaded.result.unwrap()["analysis"], "final analysis");
    }

    #[tokio::test]
    async fn empty_url_list_fails_fast() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "harvest_analyze").await.unwrap();
        let registry = ConnectorRegistry::new().register(Arc::new(StubArticleConnector));
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
            task.id,
            vec![],
            AnalysisMode::Quick,
        )
        .await
        .unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "failed");
    }

    #[test]
    fn unrecognized_mode_falls_back_to_comprehensive() {
        assert_eq!(AnalysisMode::parse("nonsense"), AnalysisMode::Comprehensive);
        assert_eq!(AnalysisMode::parse("trend"), AnalysisMode::Trend);
    }
}

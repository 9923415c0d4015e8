//! Creator-monitor orchestrator (spec §2 "creator monitor" workflow),
//! grounded on `original_source/services/sniper/xhs_creator.py`'s
//! `CreatorMonitorAgent.execute`.
//!
//! Flow: harvest each creator's recent notes -> fetch full details in one
//! batched fan-out -> per creator, walk notes newest-first and stop at
//! the first non-pinned note older than the monitoring window (pinned
//! notes never trigger the stop, they're collected separately) ->
//! format a natural-language report -> `Task::complete`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::connectors::ExtractResult;
use crate::gate::{ConnectorService, run_scoped};
use crate::task::TaskStore;

use super::status_output;

const PLATFORM: &str = "short-video-social";
const NOTES_PER_CREATOR_LIMIT: usize = 20;
const DETAIL_CONCURRENCY: usize = 2;

/// Default monitoring window (spec §4.H "creator monitor", 10 days) used
/// when the caller doesn't override it.
pub const DEFAULT_WINDOW_DAYS: i64 = 10;

/// Runs one creator-monitor task end to end. `task_id` must already name a
/// persisted, non-terminal [`crate::task::Task`].
pub async fn run(
    task_store: Arc<dyn TaskStore>,
    gate: Arc<ConnectorService>,
    task_id: Uuid,
    creator_ids: Vec<String>,
    window_days: i64,
) -> anyhow::Result<()> {
    let mut task = task_store
        .get(task_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

    if creator_ids.is_empty() {
        task.fail("no input, please provide at least one creator id and retry", Some(0));
        task_store.save(&task).await?;
        return Ok(());
    }

    task.start();
    task.log_step(
        0,
        "task initialization",
        HashMap::from([("creator_count".to_string(), Value::from(creator_ids.len()))]),
        HashMap::from([("task_id".to_string(), Value::String(task_id.to_string()))]),
        "completed",
    );
    task.progress = 10;
    task_store.save(&task).await?;

    run_scoped(Arc::clone(&gate), Arc::clone(&task_store), move |gate| {
        let task_store = Arc::clone(&task_store);
        let creator_ids = creator_ids.clone();
        async move {
            let harvested = gate
                .harvest_user_content(PLATFORM, &creator_ids, NOTES_PER_CREATOR_LIMIT)
                .await?;

            {
                let mut task = load(&task_store, task_id).await?;
                task.log_step(
                    1,
                    "harvest creator notes",
                    HashMap::from([("creator_count".to_string(), Value::from(creator_ids.len()))]),
                    status_output(format!("harvested {} creator(s)", harvested.len())),
                    "completed",
                );
                task.progress = 50;
                task_store.save(&task).await?;
            }

            // Flatten to one fan-out for the detail fetch (spec §4.E.iii),
            // keeping each creator's own url order so the window scan below
            // can re-sort completion-order results back into feed order.
            let mut creator_urls: HashMap<String, Vec<String>> = HashMap::new();
            let mut all_urls: Vec<String> = Vec::new();
            for (creator_id, notes) in &harvested {
                let urls: Vec<String> = notes.iter().filter(|n| n.success).map(note_url).collect();
                all_urls.extend(urls.iter().cloned());
                creator_urls.insert(creator_id.clone(), urls);
            }

            let details = if all_urls.is_empty() {
                Vec::new()
            } else {
                gate.get_note_details(PLATFORM, &all_urls, DETAIL_CONCURRENCY).await?
            };
            let details_by_url: HashMap<&str, &ExtractResult> = details
                .iter()
                .filter(|d| d.success)
                .map(|d| (d.url.as_str(), d))
                .collect();

            let now = Utc::now();
            let mut creator_reports: HashMap<String, Value> = HashMap::new();
            for creator_id in &creator_ids {
                let urls = creator_urls.get(creator_id).cloned().unwrap_or_default();
                let mut today_notes = Vec::new();
                let mut pinned_notes = Vec::new();
                let mut last_note_outside_window = None;

                for url in &urls {
                    let Some(note) = details_by_url.get(url.as_str()).and_then(|d| d.data.as_ref()) else {
                        continue;
                    };
                    let is_pinned = note.get("is_pinned").and_then(Value::as_bool).unwrap_or(false);
                    if is_pinned {
                        pinned_notes.push(note.clone());
                        continue;
                    }
                    match publish_time(note) {
                        Some(ts) if now.signed_duration_since(ts) <= ChronoDuration::days(window_days) => {
                            today_notes.push(note.clone());
                        }
                        Some(_) => {
                            last_note_outside_window = Some(note.clone());
                            break;
                        }
                        // Unknown publish time can't be confirmed as in-window; skip it
                        // rather than let it falsely trip the early exit.
                        None => continue,
                    }
                }

                creator_reports.insert(
                    creator_id.clone(),
                    serde_json::json!({
                        "today_notes": today_notes,
                        "last_note_outside_window": last_note_outside_window,
                        "pinned_notes": pinned_notes,
                    }),
                );
            }

            {
                let mut task = load(&task_store, task_id).await?;
                task.log_step(
                    2,
                    "analyze creator notes",
                    HashMap::from([("window_days".to_string(), Value::from(window_days))]),
                    status_output("window scan complete"),
                    "completed",
                );
                task.progress = 90;
                task_store.save(&task).await?;
            }

            let report = format_report(&creator_ids, &creator_reports, window_days);

            let mut task = load(&task_store, task_id).await?;
            task.log_step(
                3,
                "format report",
                HashMap::new(),
                status_output(format!("{} char report", report.len())),
                "completed",
            );
            task.complete(serde_json::json!({
                "report": report,
                "creators": creator_reports,
            }));
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

fn note_url(result: &ExtractResult) -> String {
    result
        .data
        .as_ref()
        .and_then(|d| d.get("full_url"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("https://www.xiaohongshu.com/explore/{}", result.url))
}

fn publish_time(note: &Value) -> Option<DateTime<Utc>> {
    match note.get("publish_time")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_i64()?;
            let secs = if secs > 10_000_000_000 { secs / 1000 } else { secs };
            DateTime::from_timestamp(secs, 0)
        }
        _ => None,
    }
}

fn format_report(creator_ids: &[String], reports: &HashMap<String, Value>, window_days: i64) -> String {
    let mut lines = vec![format!("Creator monitor report (last {window_days} day(s)):")];
    for creator_id in creator_ids {
        let Some(report) = reports.get(creator_id) else { continue };
        let today = report["today_notes"].as_array().map(Vec::len).unwrap_or(0);
        let pinned = report["pinned_notes"].as_array().map(Vec::len).unwrap_or(0);
        lines.push(format!("- {creator_id}: {today} new note(s) in window, {pinned} pinned note(s)"));
        if let Some(title) = report["last_note_outside_window"]
            .as_object()
            .and_then(|o| o.get("title"))
            .and_then(Value::as_str)
        {
            lines.push(format!("  scan stopped at: \"{title}\" (outside window)"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{CapabilitySet, Connector, ConnectorError};
    use crate::gate::ConnectorRegistry;
    use crate::store::FakeLockStore;
    use crate::task::InMemoryTaskStore;
    use async_trait::async_trait;
    use std::collections::HashMap as Map;

    fn note(id: &str, days_ago: i64, pinned: bool, title: &str) -> Value {
        serde_json::json!({
            "note_id": id,
            "full_url": format!("https://x/{id}"),
            "title": title,
            "is_pinned": pinned,
            "publish_time": (Utc::now() - ChronoDuration::days(days_ago)).to_rfc3339(),
        })
    }

    struct StubCreatorConnector {
        notes_by_creator: Map<String, Vec<Value>>,
    }

    #[async_trait]
    impl Connector for StubCreatorConnector {
        fn platform_tag(&self) -> &'static str {
            PLATFORM
        }
        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet {
                harvest: true,
                get_detail: true,
                ..Default::default()
            }
        }
        async fn harvest_user_content(
            &self,
            _s: &str,
            _sid: &str,
            creator_ids: &[String],
            _limit: usize,
        ) -> Result<HashMap<String, Vec<ExtractResult>>, ConnectorError> {
            let mut out = HashMap::new();
            for creator_id in creator_ids {
                let notes = self.notes_by_creator.get(creator_id).cloned().unwrap_or_default();
                let results = notes
                    .iter()
                    .map(|n| ExtractResult::ok(n["note_id"].as_str().unwrap(), n.clone()))
                    .collect();
                out.insert(creator_id.clone(), results);
            }
            Ok(out)
        }
        async fn get_note_detail(
            &self,
            _s: &str,
            _sid: &str,
            urls: &[String],
            _concurrency: usize,
        ) -> Result<Vec<ExtractResult>, ConnectorError> {
            let all_notes: Vec<&Value> = self.notes_by_creator.values().flatten().collect();
            Ok(urls
                .iter()
                .map(|url| {
                    all_notes
                        .iter()
                        .find(|n| n["full_url"].as_str() == Some(url.as_str()))
                        .map(|n| ExtractResult::ok(url.clone(), (*n).clone()))
                        .unwrap_or_else(|| ExtractResult::err(url.clone(), "not found"))
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn pinned_notes_do_not_trigger_early_exit_but_old_unpinned_notes_do() {
        let mut notes_by_creator = Map::new();
        // Feed order: pinned-but-stale first (common "pin to top" UI), then
        // three fresh notes, then one stale note that stops the scan, then a
        // second stale note that must NOT show up anywhere in the report.
        notes_by_creator.insert(
            "c1".to_string(),
            vec![
                note("pinned1", 40, true, "pinned old post"),
                note("n1", 1, false, "fresh 1"),
                note("n2", 2, false, "fresh 2"),
                note("n3", 3, false, "fresh 3"),
                note("old1", 20, false, "first stale post"),
                note("old2", 30, false, "should never appear"),
            ],
        );

        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "creator_monitor").await.unwrap();
        let registry = ConnectorRegistry::new().register(Arc::new(StubCreatorConnector { notes_by_creator }));
        let gate = Arc::new(ConnectorService::new(
            Arc::new(FakeLockStore::new()),
            registry,
            "system",
            "u1",
            task.id,
        ));

        run(task_store.clone(), gate, task.id, vec!["c1".to_string()], DEFAULT_WINDOW_DAYS)
            .await
            .unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "completed");
        assert_eq!(loaded.progress, 100);

        let result = loaded.result.unwrap();
        let creator_report = &result["creators"]["c1"];
        assert_eq!(creator_report["today_notes"].as_array().unwrap().len(), 3);
        assert_eq!(creator_report["pinned_notes"].as_array().unwrap().len(), 1);
        assert_eq!(creator_report["last_note_outside_window"]["note_id"], "old1");

        let report_text = result["report"].as_str().unwrap();
        assert!(!report_text.contains("should never appear"));
    }

    #[tokio::test]
    async fn empty_creator_list_fails_fast() {
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let task = task_store.create("system", "u1", "creator_monitor").await.unwrap();
        let registry = ConnectorRegistry::new().register(Arc::new(StubCreatorConnector {
            notes_by_creator: Map::new(),
        }));
        let gate = Arc::new(ConnectorService::new(
            Arc::new(FakeLockStore::new()),
            registry,
            "system",
            "u1",
            task.id,
        ));

        run(task_store.clone(), gate, task.id, vec![], DEFAULT_WINDOW_DAYS).await.unwrap();

        let loaded = task_store.get(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status.as_str(), "failed");
    }
}

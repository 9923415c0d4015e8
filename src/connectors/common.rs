//! Shared operation shape for platform connectors (spec §4.E.i-iii):
//! context/session setup, bounded fan-out, and detail-fetch batching.
//! Grounded on `original_source/services/sniper/connectors/base.py`'s
//! `_get_browser_session`/`_cleanup_resources` and on
//! `xiaohongshu.py::get_note_detail`'s two-level batching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::connectors::{ConnectorError, ExtractResult};
use crate::pagedriver::PageSessionHandle;
use crate::remote_browser::{BrowserClient, Context, FingerprintOptions, Session};

/// A live session attached over CDP, ready for a fan-out of page workers.
/// Owns the teardown contract from spec §4.E.i step 7: whoever opened
/// this must call [`close_session`] exactly once, on every code path.
pub struct ConnectorSession {
    pub browser_session: Session,
    pub page_session: Box<dyn PageSessionHandle>,
}

/// Builds `context_id`, fetches/creates the named context, creates and
/// initializes a session bound to it, and attaches CDP (spec §4.E.i
/// steps 1-4).
pub async fn open_session(
    client: &dyn BrowserClient,
    platform_tag: &str,
    source: &str,
    source_id: &str,
    create_context_if_missing: bool,
    fingerprint: FingerprintOptions,
) -> Result<(Context, ConnectorSession), ConnectorError> {
    let context_id = crate::remote_browser::context_id(platform_tag, source, source_id);
    let context = client
        .context_get(&context_id, create_context_if_missing)
        .await
        .map_err(|e| match e {
            crate::remote_browser::BrowserClientError::ContextNotFound(_) => ConnectorError::ContextNotFound,
            other => ConnectorError::Browser(other),
        })?;

    let browser_session = client.session_create(Some(&context)).await?;
    client.session_initialize(&browser_session, &fingerprint).await?;
    let page_session = client.attach(&browser_session).await?;

    Ok((
        context,
        ConnectorSession {
            browser_session,
            page_session,
        },
    ))
}

/// Tears down a session, syncing context per spec §4.E.i step 7: "On any
/// exception between steps 3 and 7, still delete the session." Callers
/// invoke this from a single cleanup path regardless of success/failure,
/// matching the scope-exit discipline in spec §9.
pub async fn close_session(
    client: &dyn BrowserClient,
    session: ConnectorSession,
    sync_context: bool,
) {
    drop(session.page_session);
    if let Err(err) = client.session_delete(&session.browser_session, sync_context).await {
        tracing::warn!(error = %err, "failed to delete remote browser session, leaving for provider-side GC");
    }
}

/// Runs `work` for every item in `items` with at most `concurrency`
/// in flight, collecting results in completion order (spec §5 "Inside
/// one fan-out batch, result ordering is completion order, not input
/// order"). A panicking/erroring worker does not abort its siblings —
/// `work` is expected to catch its own errors into `ExtractResult`.
pub async fn fan_out<F, Fut>(items: Vec<String>, concurrency: usize, work: F) -> Vec<ExtractResult>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ExtractResult> + Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, 10)));
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    for item in items {
        let permit = Arc::clone(&semaphore);
        let work = Arc::clone(&work);
        tasks.spawn(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            work(item).await
        });
    }
    let mut results = Vec::with_capacity(tasks.len());
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(join_err) => results.push(ExtractResult::err("unknown", join_err.to_string())),
        }
    }
    results
}

/// Streaming counterpart to [`fan_out`] (spec §9 "Streaming with
/// backpressure"): sends each item's result into `tx` as soon as its
/// worker completes rather than collecting into a `Vec` first, so the
/// receiver sees genuinely incremental delivery. `tx`'s capacity bounds
/// how far ahead of the receiver the fan-out can race.
pub async fn fan_out_stream<F, Fut>(items: Vec<String>, concurrency: usize, work: F, tx: mpsc::Sender<ExtractResult>)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ExtractResult> + Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.clamp(1, 10)));
    let work = Arc::new(work);
    let mut tasks = JoinSet::new();
    for item in items {
        let permit = Arc::clone(&semaphore);
        let work = Arc::clone(&work);
        tasks.spawn(async move {
            let _permit = permit.acquire_owned().await.expect("semaphore never closed");
            work(item).await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(result) => result,
            Err(join_err) => ExtractResult::err("unknown", join_err.to_string()),
        };
        if tx.send(result).await.is_err() {
            break;
        }
    }
}

/// `get_note_detail(urls, concurrency)` batching (spec §4.E.iii): batches
/// of 3, awaited sequentially, each batch internally bounded by
/// `concurrency`. Preserves the two-level structure verbatim rather than
/// flattening into a single semaphore.
pub async fn fan_out_in_batches<F, Fut>(
    items: Vec<String>,
    concurrency: usize,
    work: F,
) -> Vec<ExtractResult>
where
    F: Fn(String) -> Fut + Send + Sync + Clone + 'static,
    Fut: std::future::Future<Output = ExtractResult> + Send,
{
    const BATCH_SIZE: usize = 3;
    let mut results = Vec::with_capacity(items.len());
    for batch in items.chunks(BATCH_SIZE) {
        let batch_results = fan_out(batch.to_vec(), concurrency, work.clone()).await;
        results.extend(batch_results);
    }
    results
}

/// In-memory `LoginTask` map (spec §3 LoginTask): `context_id ->
/// {session, deadline}`, written when QR login starts, read on confirm,
/// removed on confirm or sweeper timeout.
#[derive(Clone, Default)]
pub struct LoginTaskMap {
    inner: Arc<Mutex<HashMap<String, PendingLogin>>>,
}

pub struct PendingLogin {
    pub session: Session,
    pub deadline: std::time::Instant,
}

impl LoginTaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context_id: String, session: Session, timeout: Duration) {
        self.inner.lock().insert(
            context_id,
            PendingLogin {
                session,
                deadline: std::time::Instant::now() + timeout,
            },
        );
    }

    pub fn remove(&self, context_id: &str) -> Option<PendingLogin> {
        self.inner.lock().remove(context_id)
    }

    /// Returns every entry whose deadline has elapsed, removing them
    /// from the map (used by a background timer per connector instance;
    /// spec §4.E.iv "A background timer ... drives eventual teardown").
    pub fn drain_expired(&self) -> Vec<(String, PendingLogin)> {
        let mut inner = self.inner.lock();
        let now = std::time::Instant::now();
        let expired_keys: Vec<String> = inner
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        expired_keys
            .into_iter()
            .filter_map(|k| inner.remove(&k).map(|v| (k, v)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_collects_all_results_even_with_errors() {
        let results = fan_out(
            vec!["a".to_string(), "b".to_string(), "c".to_string()],
            2,
            |item| async move {
                if item == "b" {
                    ExtractResult::err(item, "boom")
                } else {
                    ExtractResult::ok(item, serde_json::json!({}))
                }
            },
        )
        .await;
        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.success).count(), 2);
    }

    #[tokio::test]
    async fn fan_out_in_batches_preserves_item_count_across_batches() {
        let items: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        let results = fan_out_in_batches(items, 2, |item| async move {
            ExtractResult::ok(item, serde_json::json!({}))
        })
        .await;
        assert_eq!(results.len(), 7);
    }

    #[test]
    fn login_task_map_drains_only_expired() {
        let map = LoginTaskMap::new();
        map.insert("ctx-a".to_string(), test_session("s1"), Duration::from_millis(0));
        map.insert("ctx-b".to_string(), test_session("s2"), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        let expired = map.drain_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "ctx-a");
        assert!(map.remove("ctx-b").is_some());
    }

    fn test_session(id: &str) -> Session {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "context_id": null,
            "endpoint_url": "ws://x",
            "resource_url": "https://x",
        }))
        .unwrap()
    }
}

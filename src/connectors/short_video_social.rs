//! Short-video-social platform connector (spec §4.E), grounded on
//! `original_source/services/sniper/connectors/xiaohongshu.py`: the
//! richest of the three connectors, supporting every operation in
//! [`CapabilitySet`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::connectors::common::{
    ConnectorSession, LoginTaskMap, close_session, fan_out_in_batches, fan_out_stream, open_session,
};
use crate::connectors::{CapabilitySet, Connector, ConnectorError, ExtractResult, LoginOutcome};
use crate::pagedriver::PageHandle;
use crate::remote_browser::{BrowserClient, FingerprintOptions};

const PLATFORM_TAG: &str = "short-video-social";
const LOGIN_PROBE_SELECTOR: &str = "[data-testid=\"user-avatar\"]";

pub struct ShortVideoSocialConnector {
    client: Arc<dyn BrowserClient>,
    login_tasks: LoginTaskMap,
}

impl ShortVideoSocialConnector {
    pub fn new(client: Arc<dyn BrowserClient>) -> Self {
        Self {
            client,
            login_tasks: LoginTaskMap::new(),
        }
    }

    fn fingerprint() -> FingerprintOptions {
        FingerprintOptions::with_locales(vec!["zh-CN".to_string()])
    }

    /// Client-state-dump extraction of one note/post's detail
    /// (spec §4.E strategy 1).
    async fn extract_note_detail(page: &dyn PageHandle) -> Option<Value> {
        crate::pagedriver::poll_initial_state(
            page,
            "(() => { \
                const m = window.__INITIAL_STATE__ && window.__INITIAL_STATE__.note && window.__INITIAL_STATE__.note.noteDetailMap; \
                if (!m) return null; \
                const first = Object.values(m)[0]; \
                return (first && (first.note || first._value)) || null; \
            })()",
        )
        .await
    }

    fn search_extract_script(keyword: &str) -> String {
        format!(
            "(() => {{ \
                const feeds = window.__INITIAL_STATE__?.search?.feeds?.value || window.__INITIAL_STATE__?.search?.feeds?._value; \
                return feeds ? JSON.stringify(feeds) : null; \
            }})() /* keyword={keyword} */"
        )
    }
}

#[async_trait]
impl Connector for ShortVideoSocialConnector {
    fn platform_tag(&self) -> &'static str {
        PLATFORM_TAG
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            search: true,
            harvest: true,
            get_detail: true,
            publish: true,
            login_cookie: true,
            login_qr: true,
        }
    }

    async fn search_and_extract(
        &self,
        source: &str,
        source_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ExtractResult>, ConnectorError> {
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, false, Self::fingerprint()).await?;

        let result = async {
            let mut all = Vec::new();
            for keyword in keywords {
                // Per-item failure isolation (spec §4.E.i step 5): one
                // keyword's page failing does not abort the rest.
                let page = match session
                    .page_session
                    .new_page(&format!("https://www.xiaohongshu.com/search_result?keyword={keyword}"))
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        all.push(ExtractResult::err(keyword.clone(), e.to_string()));
                        continue;
                    }
                };
                page.wait_for_selector("body", Duration::from_secs(10)).await.ok();
                let script = Self::search_extract_script(keyword);
                let raw: Value = page.evaluate_opt(&script).await.unwrap_or(Value::Null);
                page.close().await.ok();
                if let Value::String(json_text) = raw {
                    if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&json_text) {
                        for item in items {
                            all.push(ExtractResult::ok(
                                item.get("id").and_then(Value::as_str).unwrap_or(keyword).to_string(),
                                item,
                            ));
                        }
                    }
                }
                if all.len() >= limit {
                    break;
                }
            }
            all.truncate(limit);
            Ok::<_, ConnectorError>(all)
        }
        .await;

        close_session(self.client.as_ref(), session, true).await;
        result
    }

    async fn harvest_user_content(
        &self,
        source: &str,
        source_id: &str,
        creator_ids: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ExtractResult>>, ConnectorError> {
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, false, Self::fingerprint()).await?;

        let result = async {
            let mut per_creator = HashMap::new();
            for creator_id in creator_ids {
                // Per-item failure isolation (spec §4.E.i step 5): one
                // creator's page failing does not abort the rest.
                let page = match session
                    .page_session
                    .new_page(&format!("https://www.xiaohongshu.com/user/profile/{creator_id}"))
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        per_creator.insert(
                            creator_id.clone(),
                            vec![ExtractResult::err(creator_id.clone(), e.to_string())],
                        );
                        continue;
                    }
                };
                page.wait_for_selector("body", Duration::from_secs(10)).await.ok();
                let notes = crate::pagedriver::poll_initial_state(
                    &page,
                    "(() => { \
                        const u = window.__INITIAL_STATE__?.user?.notes?.value || window.__INITIAL_STATE__?.user?.notes?._value; \
                        return u ? JSON.stringify(u) : null; \
                    })()",
                )
                .await;
                page.close().await.ok();

                let mut items = Vec::new();
                if let Some(Value::String(json_text)) = notes {
                    if let Ok(Value::Array(arr)) = serde_json::from_str::<Value>(&json_text) {
                        for note in arr.into_iter().take(limit) {
                            items.push(ExtractResult::ok(
                                note.get("note_id").and_then(Value::as_str).unwrap_or("").to_string(),
                                note,
                            ));
                        }
                    }
                }
                per_creator.insert(creator_id.clone(), items);
            }
            Ok::<_, ConnectorError>(per_creator)
        }
        .await;

        close_session(self.client.as_ref(), session, true).await;
        result
    }

    async fn get_note_detail(
        &self,
        source: &str,
        source_id: &str,
        urls: &[String],
        concurrency: usize,
    ) -> Result<Vec<ExtractResult>, ConnectorError> {
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, false, Self::fingerprint()).await?;
        let ConnectorSession { browser_session, page_session } = session;
        let page_session: Arc<dyn crate::pagedriver::PageSessionHandle> = Arc::from(page_session);

        let work_session = Arc::clone(&page_session);
        let results = fan_out_in_batches(urls.to_vec(), concurrency, move |url| {
            let page_session = Arc::clone(&work_session);
            async move {
                match page_session.new_page(&url).await {
                    Ok(page) => {
                        page.wait_for_selector("body", Duration::from_secs(10)).await.ok();
                        let data = Self::extract_note_detail(page.as_ref()).await;
                        let _ = page.close().await;
                        match data {
                            Some(value) => ExtractResult::ok(url, value),
                            None => ExtractResult::err(url, "note detail not found in client state"),
                        }
                    }
                    Err(e) => ExtractResult::err(url, e.to_string()),
                }
            }
        })
        .await;

        drop(page_session);
        if let Err(err) = self.client.session_delete(&browser_session, true).await {
            tracing::warn!(error = %err, "failed to delete remote browser session, leaving for provider-side GC");
        }

        Ok(results)
    }

    /// Overrides the default buffer-then-send implementation (spec §9
    /// "Streaming with backpressure"): feeds the channel as each page
    /// completes instead of collecting the whole batch first, so the SSE
    /// surface actually streams rather than bursting everything at the end.
    async fn get_note_detail_stream(
        &self,
        source: &str,
        source_id: &str,
        urls: &[String],
        concurrency: usize,
    ) -> Result<mpsc::Receiver<ExtractResult>, ConnectorError> {
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, false, Self::fingerprint()).await?;
        let ConnectorSession { browser_session, page_session } = session;
        let page_session: Arc<dyn crate::pagedriver::PageSessionHandle> = Arc::from(page_session);

        let (tx, rx) = mpsc::channel(concurrency.clamp(1, 10));
        let client = Arc::clone(&self.client);
        let urls = urls.to_vec();
        let work_session = Arc::clone(&page_session);
        tokio::spawn(async move {
            fan_out_stream(
                urls,
                concurrency,
                move |url| {
                    let page_session = Arc::clone(&work_session);
                    async move {
                        match page_session.new_page(&url).await {
                            Ok(page) => {
                                page.wait_for_selector("body", Duration::from_secs(10)).await.ok();
                                let data = Self::extract_note_detail(page.as_ref()).await;
                                let _ = page.close().await;
                                match data {
                                    Some(value) => ExtractResult::ok(url, value),
                                    None => ExtractResult::err(url, "note detail not found in client state"),
                                }
                            }
                            Err(e) => ExtractResult::err(url, e.to_string()),
                        }
                    }
                },
                tx,
            )
            .await;

            drop(page_session);
            if let Err(err) = client.session_delete(&browser_session, true).await {
                tracing::warn!(error = %err, "failed to delete remote browser session, leaving for provider-side GC");
            }
        });

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
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, false, Self::fingerprint()).await?;

        let instruction = format!(
            "Publish a {content_type} post with text {content:?}, tags {tags:?}, images {images:?}"
        );
        let result = async {
            self.client
                .agent_navigate(&session.browser_session, "https://creator.xiaohongshu.com/publish")
                .await?;
            let success = self.client.agent_act(&session.browser_session, &instruction).await?;
            Ok::<_, ConnectorError>(serde_json::json!({
                "success": success,
                "platform": PLATFORM_TAG,
                "content": content,
            }))
        }
        .await;

        close_session(self.client.as_ref(), session, true).await;
        result
    }

    async fn login_cookie(
        &self,
        source: &str,
        source_id: &str,
        cookies: &HashMap<String, String>,
    ) -> Result<LoginOutcome, ConnectorError> {
        let (context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, true, Self::fingerprint()).await?;

        let probe = async {
            let cdp_cookies: Vec<_> = cookies
                .iter()
                .map(|(name, value)| {
                    chromiumoxide::cdp::browser_protocol::network::CookieParam::builder()
                        .name(name.clone())
                        .value(value.clone())
                        .domain(".xiaohongshu.com".to_string())
                        .path("/".to_string())
                        .build()
                        .expect("cookie builder requires name+value, both supplied above")
                })
                .collect();
            session.page_session.add_cookies(cdp_cookies).await?;

            let page = session.page_session.new_page("https://www.xiaohongshu.com").await?;
            page.wait_for_load_state().await.ok();
            let logged_in = page.query_selector(LOGIN_PROBE_SELECTOR).await.unwrap_or(false);
            page.close().await.ok();

            Ok::<_, ConnectorError>(logged_in)
        }
        .await;

        // On success, delete with sync_context=true; on failure, delete
        // without sync and raise (spec §4.E.iv "Cookie login").
        match probe {
            Ok(true) => {
                close_session(self.client.as_ref(), session, true).await;
                Ok(LoginOutcome {
                    is_logged_in: true,
                    context_id: context.id,
                    qrcode: None,
                    timeout: None,
                })
            }
            Ok(false) => {
                let resource_url = session.browser_session.resource_url().to_string();
                close_session(self.client.as_ref(), session, false).await;
                Err(ConnectorError::NotLoggedIn {
                    context_id: context.id,
                    resource_url,
                })
            }
            Err(e) => {
                close_session(self.client.as_ref(), session, false).await;
                Err(e)
            }
        }
    }

    async fn login_qr(&self, source: &str, source_id: &str, timeout_secs: u64) -> Result<LoginOutcome, ConnectorError> {
        let (context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, true, Self::fingerprint()).await?;

        let probe_page = session.page_session.new_page("https://www.xiaohongshu.com").await?;
        probe_page.wait_for_load_state().await.ok();
        let already_logged_in = probe_page.query_selector(LOGIN_PROBE_SELECTOR).await.unwrap_or(false);
        probe_page.close().await.ok();

        if already_logged_in {
            close_session(self.client.as_ref(), session, true).await;
            return Ok(LoginOutcome {
                is_logged_in: true,
                context_id: context.id,
                qrcode: None,
                timeout: None,
            });
        }

        self.client
            .agent_act(&session.browser_session, "navigate to the login page and display the QR code")
            .await?;
        let resource_url = session.browser_session.resource_url().to_string();
        self.login_tasks.insert(
            context.id.clone(),
            session.browser_session,
            Duration::from_secs(timeout_secs),
        );
        // Intentionally not closed here: the browser stays alive until
        // confirm or the sweeper's timeout drains it (spec §4.E.iv).
        drop(session.page_session);

        Ok(LoginOutcome {
            is_logged_in: false,
            context_id: context.id,
            qrcode: Some(resource_url),
            timeout: Some(timeout_secs),
        })
    }

    async fn login_confirm(&self, context_id: &str) -> Result<bool, ConnectorError> {
        let Some(pending) = self.login_tasks.remove(context_id) else {
            return Ok(false);
        };
        self.client.session_delete(&pending.session, true).await?;
        Ok(true)
    }

    async fn sweep_expired_logins(&self) {
        for (context_id, pending) in self.login_tasks.drain_expired() {
            if let Err(err) = self.client.session_delete(&pending.session, true).await {
                tracing::warn!(error = %err, context_id = %context_id, "failed to sync+delete expired login session");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_browser::fake::FakeBrowserClient;

    #[tokio::test]
    async fn login_qr_returns_resource_url_and_registers_pending_login() {
        let fake = Arc::new(FakeBrowserClient::new());
        let connector = ShortVideoSocialConnector::new(fake.clone() as Arc<dyn BrowserClient>);
        let outcome = connector.login_qr("tenant", "user1", 5).await.unwrap();
        assert!(!outcome.is_logged_in);
        assert!(outcome.qrcode.is_some());
        assert_eq!(fake.live_sessions(), 1);
    }

    #[tokio::test]
    async fn login_confirm_deletes_the_pending_session() {
        let fake = Arc::new(FakeBrowserClient::new());
        let connector = ShortVideoSocialConnector::new(fake.clone() as Arc<dyn BrowserClient>);
        let outcome = connector.login_qr("tenant", "user1", 5).await.unwrap();
        assert!(connector.login_confirm(&outcome.context_id).await.unwrap());
        assert_eq!(fake.live_sessions(), 0);
    }

    #[tokio::test]
    async fn sweep_expired_logins_deletes_sessions_past_their_deadline() {
        let fake = Arc::new(FakeBrowserClient::new());
        let connector = ShortVideoSocialConnector::new(fake.clone() as Arc<dyn BrowserClient>);
        connector.login_qr("tenant", "user1", 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        connector.sweep_expired_logins().await;
        assert_eq!(fake.live_sessions(), 0);
    }
}

//! Messaging-article platform connector (spec §4.E), grounded on
//! `original_source/services/sniper/connectors/wechat.py`. Public
//! articles need no login (`_require_login` in the source is a no-op
//! probe), so this connector only implements `harvest_user_content` and
//! `get_note_detail` — matching the gate config table in spec §4.F,
//! which carries no `login`/`search`/`publish` row for this platform.
//!
//! Article bodies are long-form prose rather than a flat record, so
//! detail extraction goes through [`crate::remote_browser::BrowserClient::agent_extract`]
//! (LLM-driven structured extraction) instead of a CSS/`evaluate` probe
//! (spec §4.C: "invoked where CSS-selector extraction is insufficient").

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::connectors::common::{close_session, fan_out_in_batches, open_session};
use crate::connectors::{CapabilitySet, Connector, ConnectorError, ExtractResult};
use crate::remote_browser::{BrowserClient, FingerprintOptions};

const PLATFORM_TAG: &str = "messaging-article";

fn article_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "title": {"type": "string"},
            "author": {"type": "string"},
            "publish_time": {"type": "string"},
            "key_points": {"type": "array", "items": {"type": "string"}},
            "struct": {"type": "string"},
        },
        "required": ["title", "author"],
    })
}

pub struct MessagingArticleConnector {
    client: Arc<dyn BrowserClient>,
}

impl MessagingArticleConnector {
    pub fn new(client: Arc<dyn BrowserClient>) -> Self {
        Self { client }
    }

    fn fingerprint() -> FingerprintOptions {
        FingerprintOptions::with_locales(vec!["zh-CN".to_string()])
    }
}

#[async_trait]
impl Connector for MessagingArticleConnector {
    fn platform_tag(&self) -> &'static str {
        PLATFORM_TAG
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            search: false,
            harvest: true,
            get_detail: true,
            publish: false,
            login_cookie: false,
            login_qr: false,
        }
    }

    async fn harvest_user_content(
        &self,
        source: &str,
        source_id: &str,
        creator_ids: &[String],
        limit: usize,
    ) -> Result<HashMap<String, Vec<ExtractResult>>, ConnectorError> {
        let (_context, session) =
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, true, Self::fingerprint()).await?;

        let result = async {
            let mut per_account = HashMap::new();
            for account in creator_ids {
                // Per-item failure isolation (spec §4.E.i step 5): one
                // account's extraction failing does not abort the rest.
                let articles = match self
                    .client
                    .agent_extract(
                        &session.browser_session,
                        &format!("list the most recent articles published by account {account}, with their URLs"),
                        &serde_json::json!({
                            "type": "array",
                            "items": {"type": "object", "properties": {"url": {"type": "string"}, "title": {"type": "string"}}},
                        }),
                    )
                    .await
                {
                    Ok(articles) => articles,
                    Err(e) => {
                        per_account.insert(account.clone(), vec![ExtractResult::err(account.clone(), e.to_string())]);
                        continue;
                    }
                };
                let mut items = Vec::new();
                if let Value::Array(arr) = articles {
                    for article in arr.into_iter().take(limit) {
                        items.push(ExtractResult::ok(
                            article.get("url").and_then(Value::as_str).unwrap_or("").to_string(),
                            article,
                        ));
                    }
                }
                per_account.insert(account.clone(), items);
            }
            Ok::<_, ConnectorError>(per_account)
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
            open_session(self.client.as_ref(), PLATFORM_TAG, source, source_id, true, Self::fingerprint()).await?;

        let client = Arc::clone(&self.client);
        let browser_session = session.browser_session.clone();
        let results = fan_out_in_batches(urls.to_vec(), concurrency, move |url| {
            let client = Arc::clone(&client);
            let browser_session = browser_session.clone();
            async move {
                if let Err(e) = client.agent_navigate(&browser_session, &url).await {
                    return ExtractResult::err(url, e.to_string());
                }
                match client
                    .agent_extract(&browser_session, "extract the article's title, author, publish time, key points, and a structured summary", &article_schema())
                    .await
                {
                    Ok(value) => ExtractResult::ok(url, value),
                    Err(e) => ExtractResult::err(url, e.to_string()),
                }
            }
        })
        .await;

        close_session(self.client.as_ref(), session, true).await;
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_browser::fake::FakeBrowserClient;

    #[tokio::test]
    async fn get_note_detail_closes_session_even_when_extraction_fails() {
        let fake = Arc::new(FakeBrowserClient::new());
        let connector = MessagingArticleConnector::new(fake.clone() as Arc<dyn BrowserClient>);
        let results = connector
            .get_note_detail("tenant", "user1", &["https://mp.weixin.qq.com/s/abc".to_string()], 2)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(fake.live_sessions(), 0);
    }

    #[tokio::test]
    async fn capabilities_exclude_search_and_publish() {
        let fake = Arc::new(FakeBrowserClient::new());
        let connector = MessagingArticleConnector::new(fake as Arc<dyn BrowserClient>);
        let caps = connector.capabilities();
        assert!(!caps.search);
        assert!(!caps.publish);
        assert!(caps.harvest);
        assert!(caps.get_detail);
    }
}

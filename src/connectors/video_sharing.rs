//! Video-sharing platform connector (spec §4.E), grounded on
//! `original_source/services/sniper/connectors/douyin.py` for the
//! platform tag and URL shape, but diverging from it on mechanism: per
//! SPEC_FULL.md §B.3, `search_and_extract` here goes through the shared
//! [`crate::connectors::feed_stream`] parser over a fetched public JSON
//! feed rather than douyin.py's `session.browser.agent.act`/`extract`
//! loop. The gate config table (spec §4.F) carries only a
//! `search_and_extract` row for this platform, so that is the only
//! capability this connector declares — `harvest_user_content` and
//! `get_note_detail` fall through to [`Connector`]'s default
//! `NotImplemented`.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Settings;
use crate::connectors::feed_stream::parse_feed;
use crate::connectors::{CapabilitySet, Connector, ConnectorError, ExtractResult};

const PLATFORM_TAG: &str = "video-sharing";

pub struct VideoSharingConnector {
    http: reqwest::Client,
    feed_base_url: String,
}

impl VideoSharingConnector {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            feed_base_url: Settings::global().video_feed_base_url.clone(),
        }
    }

    pub fn with_feed_base_url(http: reqwest::Client, feed_base_url: impl Into<String>) -> Self {
        Self {
            http,
            feed_base_url: feed_base_url.into(),
        }
    }

    async fn fetch_feed(&self, keyword: &str) -> Result<String, ConnectorError> {
        let url = format!(
            "{}?keyword={}",
            self.feed_base_url,
            urlencoding::encode(keyword)
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ConnectorError::Other(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| ConnectorError::Other(e.to_string()))?
            .text()
            .await
            .map_err(|e| ConnectorError::Other(e.to_string()))
    }
}

#[async_trait]
impl Connector for VideoSharingConnector {
    fn platform_tag(&self) -> &'static str {
        PLATFORM_TAG
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet {
            search: true,
            ..Default::default()
        }
    }

    async fn search_and_extract(
        &self,
        _source: &str,
        _source_id: &str,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ExtractResult>, ConnectorError> {
        let mut all = Vec::new();
        for keyword in keywords {
            let remaining = limit.saturating_sub(all.len());
            if remaining == 0 {
                break;
            }
            let feed = match self.fetch_feed(keyword).await {
                Ok(feed) => feed,
                Err(err) => {
                    tracing::warn!(keyword = %keyword, error = %err, "video feed fetch failed, skipping keyword");
                    continue;
                }
            };
            for item in parse_feed(&feed, Some(keyword), remaining) {
                let id = item
                    .get("video_id")
                    .or_else(|| item.get("id"))
                    .or_else(|| item.get("url"))
                    .and_then(Value::as_str)
                    .unwrap_or(keyword)
                    .to_string();
                all.push(ExtractResult::ok(id, item));
            }
        }
        all.truncate(limit);
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_feed_is_skipped_without_erroring() {
        let connector =
            VideoSharingConnector::with_feed_base_url(reqwest::Client::new(), "http://127.0.0.1:1");
        let results = connector
            .search_and_extract("tenant", "u1", &["cats".to_string()], 10)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn capabilities_declare_search_only() {
        let connector = VideoSharingConnector::new(reqwest::Client::new());
        let caps = connector.capabilities();
        assert!(caps.search);
        assert!(!caps.harvest);
        assert!(!caps.get_detail);
        assert!(!caps.publish);
        assert!(!caps.login_qr);
    }

    #[tokio::test]
    async fn unimplemented_operations_return_not_implemented() {
        let connector = VideoSharingConnector::new(reqwest::Client::new());
        let err = connector
            .harvest_user_content("tenant", "u1", &["creator1".to_string()], 5)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::NotImplemented { .. }));
    }
}

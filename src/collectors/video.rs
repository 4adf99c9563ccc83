//! Video platform collector: search API with credential rotation, results-page
//! scraping when no key works.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use super::scrape::{extract_initial_data, videos_from_initial_data, videos_from_text, ScrapedVideo};
use super::{EvidenceCollector, SourceOutcome};
use crate::config::{VideoConfig, VIDEO_API_MAX_PAGE};
use crate::fetch::{CredentialPool, FetchClient, FetchRequest};
use crate::models::lenient::coerce_i64;
use crate::models::{EvidenceItem, Platform, PlatformMetrics, VideoMetrics};

pub struct VideoCollector {
    client: FetchClient,
    cfg: VideoConfig,
    keys: Arc<CredentialPool>,
}

impl VideoCollector {
    /// `keys` may be shared with other collectors using the same API project.
    pub fn new(client: FetchClient, cfg: VideoConfig, keys: Arc<CredentialPool>) -> Self {
        Self { client, cfg, keys }
    }

    fn watch_url(&self, id: &str) -> String {
        format!("{}/watch?v={}", self.cfg.web_base, id)
    }

    /// GET with the current key; 401/403/429 or an exhausted retry budget
    /// rotates to the next key. `None` once every key has been refused.
    async fn api_get(&self, endpoint: &str, params: &[(&str, String)]) -> Option<Value> {
        let url = format!("{}/{}", self.cfg.api_base, endpoint);
        let mut key = self.keys.current()?;
        for _ in 0..self.keys.len() {
            let req = params
                .iter()
                .fold(FetchRequest::new(&url), |req, (k, v)| req.param(k, v))
                .param("key", &key);
            match self.client.get_json(&req).await {
                Ok(Some(body)) => return Some(body),
                Ok(None) => warn!(%url, "video API gave no usable body"),
                Err(err) if err.is_access_denied() => {
                    warn!(%url, status = ?err.status(), "video API refused credential")
                }
                Err(err) => {
                    warn!(%url, error = %err, "video API request failed");
                    return None;
                }
            }
            key = self.keys.rotate_from(&key)?;
        }
        None
    }

    fn item_from_resource(&self, v: &Value) -> Option<EvidenceItem> {
        let id = v.get("id")?.as_str()?;
        let snippet = v.get("snippet");
        let stats = v.get("statistics");
        let stat = |name: &str| stats.and_then(|s| s.get(name)).and_then(coerce_i64);
        let text = |name: &str| {
            snippet
                .and_then(|s| s.get(name))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        let metrics = VideoMetrics {
            views: stat("viewCount"),
            likes: stat("likeCount"),
            comments: stat("commentCount"),
            published_at: text("publishedAt"),
            country: Some(self.cfg.region.clone()),
        };
        Some(
            EvidenceItem::new(Platform::Video, format!("youtube:{id}"), PlatformMetrics::Video(metrics))
                .with_url(self.watch_url(id))
                .with_title(text("title")),
        )
    }

    fn item_from_scraped(&self, v: ScrapedVideo) -> EvidenceItem {
        let metrics = VideoMetrics {
            views: v.views,
            country: Some(self.cfg.region.clone()),
            ..Default::default()
        };
        EvidenceItem::new(
            Platform::Video,
            format!("youtube:{}", v.video_id),
            PlatformMetrics::Video(metrics),
        )
        .with_url(self.watch_url(&v.video_id))
        .with_title(v.title)
    }

    /// Paginated search, then statistics in batches. `Blocked` when the first
    /// search page cannot be fetched with any key, or when ids were found but
    /// no statistics batch could be fetched.
    #[instrument(skip(self))]
    pub async fn search_api(&self, query: &str) -> SourceOutcome<EvidenceItem> {
        let page_size = self.cfg.page_size.clamp(1, VIDEO_API_MAX_PAGE);
        let batch_size = self.cfg.batch_size.clamp(1, VIDEO_API_MAX_PAGE);
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        let mut found_ids = false;
        let mut stats_ok = false;

        for page in 0..self.cfg.max_pages {
            let mut params = vec![
                ("part", "snippet".to_string()),
                ("q", query.to_string()),
                ("type", "video".to_string()),
                ("maxResults", page_size.to_string()),
                ("regionCode", self.cfg.region.clone()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let Some(data) = self.api_get("search", &params).await else {
                if page == 0 {
                    return SourceOutcome::Blocked;
                }
                break;
            };

            let ids: Vec<String> = data
                .get("items")
                .and_then(Value::as_array)
                .map(|rows| {
                    rows.iter()
                        .filter_map(|r| r.pointer("/id/videoId")?.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            if ids.is_empty() {
                break;
            }
            found_ids = true;

            for batch in ids.chunks(batch_size) {
                let params = [
                    ("part", "snippet,statistics".to_string()),
                    ("id", batch.join(",")),
                ];
                match self.api_get("videos", &params).await {
                    Some(body) => {
                        stats_ok = true;
                        items.extend(
                            body.get("items")
                                .and_then(Value::as_array)
                                .into_iter()
                                .flatten()
                                .filter_map(|v| self.item_from_resource(v)),
                        )
                    }
                    None => warn!(query, batch = batch.len(), "statistics batch unavailable"),
                }
            }

            page_token = data
                .get("nextPageToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if page_token.is_none() {
                break;
            }
            if page + 1 < self.cfg.max_pages && !self.cfg.page_delay.is_zero() {
                tokio::time::sleep(self.cfg.page_delay).await;
            }
        }
        if found_ids && !stats_ok {
            warn!(query, "search returned ids but statistics were unavailable");
            return SourceOutcome::Blocked;
        }
        debug!(query, count = items.len(), "video API results");
        SourceOutcome::from_items(items)
    }

    /// Scrape the rendered results page.
    #[instrument(skip(self))]
    pub async fn search_html(&self, query: &str) -> SourceOutcome<EvidenceItem> {
        let req = FetchRequest::new(format!("{}/results", self.cfg.web_base))
            .param("search_query", query)
            .header("Accept", "text/html");
        let html = match self.client.get_text(&req).await {
            Ok(Some(html)) => html,
            Ok(None) => return SourceOutcome::Blocked,
            Err(err) => {
                warn!(query, error = %err, "results page unavailable");
                return SourceOutcome::Blocked;
            }
        };

        let mut scraped = extract_initial_data(&html)
            .map(|data| videos_from_initial_data(&data))
            .unwrap_or_default();
        if scraped.is_empty() {
            scraped = videos_from_text(&html);
        }
        let cap = VIDEO_API_MAX_PAGE * self.cfg.max_pages.max(1);
        let items: Vec<EvidenceItem> = scraped
            .into_iter()
            .take(cap)
            .map(|v| self.item_from_scraped(v))
            .collect();
        debug!(query, count = items.len(), "video results scraped");
        SourceOutcome::from_items(items)
    }
}

#[async_trait]
impl EvidenceCollector for VideoCollector {
    fn name(&self) -> &'static str {
        "video"
    }

    fn concurrency(&self) -> usize {
        self.cfg.concurrency
    }

    async fn collect_query(&self, query: &str) -> Vec<EvidenceItem> {
        if self.keys.is_empty() {
            debug!(query, "no API credentials; scraping results page");
            return self.search_html(query).await.into_items();
        }
        match self.search_api(query).await {
            SourceOutcome::Found(items) => items,
            SourceOutcome::Empty => Vec::new(),
            SourceOutcome::Blocked => {
                info!(query, "video API unusable; falling back to results page");
                self.search_html(query).await.into_items()
            }
        }
    }
}

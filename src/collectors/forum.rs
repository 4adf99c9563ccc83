//! Forum collector.
//!
//! Search: `search.json` → rendered `/search` page ids → per-topic
//! `/t/{id}.json` → rendered topic page heuristics. Recent activity:
//! `latest.json`/`top.json` lists, then paginated `/latest` pages.
//! Contributor countries come from `/u/{name}.json` profile text and are cached.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use itertools::Itertools;
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, instrument, warn};

use super::country::{infer_country, CountryCache};
use super::scrape::{topic_ids, topic_page_stats};
use super::{EvidenceCollector, SourceOutcome};
use crate::config::ForumConfig;
use crate::fetch::{FetchClient, FetchRequest};
use crate::models::lenient::coerce_i64;
use crate::models::{EvidenceItem, ForumMetrics, Platform, PlatformMetrics};

#[derive(Debug, Clone, PartialEq)]
pub struct TopicRef {
    pub id: u64,
    pub title: Option<String>,
}

fn str_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| {
        v.get(*k)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn int_field(v: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| v.get(*k).and_then(coerce_i64))
}

fn topic_id(v: &Value) -> Option<u64> {
    int_field(v, &["id", "topic_id"])
        .filter(|id| *id > 0)
        .map(|id| id as u64)
}

/// Topic rows from search results and topic lists, whichever key holds them.
fn topic_rows(data: &Value) -> Vec<&Value> {
    ["/topics", "/rows", "/topic_list/topics"]
        .iter()
        .find_map(|p| data.pointer(p).and_then(Value::as_array).filter(|a| !a.is_empty()))
        .map(|rows| rows.iter().collect())
        .unwrap_or_default()
}

/// Location, then bio, then custom user fields joined.
fn profile_text(data: &Value) -> Option<String> {
    let user = data.get("user").unwrap_or(data);
    if let Some(text) = str_field(user, &["location", "bio_raw"]) {
        return Some(text);
    }
    let fields = user
        .get("user_fields")
        .or_else(|| user.get("user_fields_values"))?
        .as_object()?;
    let joined = fields
        .values()
        .filter_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

pub struct ForumCollector {
    client: FetchClient,
    cfg: ForumConfig,
    countries: CountryCache,
}

impl ForumCollector {
    pub fn new(client: FetchClient, cfg: ForumConfig) -> Self {
        let mut client = client.with_default_header("Accept", "application/json");
        if let Some(key) = &cfg.api_key {
            client = client.with_default_header("Api-Key", key);
        }
        if let Some(user) = &cfg.api_user {
            client = client.with_default_header("Api-Username", user);
        }
        let countries = CountryCache::new(cfg.country_cache_cap);
        Self {
            client,
            cfg,
            countries,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.base_url, path)
    }

    fn evidence(&self, id: u64, title: Option<String>, metrics: ForumMetrics) -> EvidenceItem {
        EvidenceItem::new(
            Platform::Forum,
            format!("discourse:{id}"),
            PlatformMetrics::Forum(metrics),
        )
        .with_url(self.url(&format!("/t/{id}")))
        .with_title(title)
    }

    async fn html(&self, path: &str, params: &[(&str, String)]) -> Option<String> {
        let req = params
            .iter()
            .fold(FetchRequest::new(self.url(path)), |req, (k, v)| req.param(k, v))
            .header("Accept", "text/html")
            .max_retries(self.cfg.html_retries);
        match self.client.get_text(&req).await {
            Ok(body) => body,
            Err(err) => {
                debug!(path, error = %err, "forum page unavailable");
                None
            }
        }
    }

    async fn json(&self, path: &str, req: FetchRequest) -> Option<Value> {
        match self.client.get_json(&req).await {
            Ok(body) => body,
            Err(err) => {
                debug!(path, status = ?err.status(), "forum JSON unavailable");
                None
            }
        }
    }

    pub async fn search_json(&self, query: &str, page: usize) -> SourceOutcome<TopicRef> {
        let req = FetchRequest::new(self.url("/search.json"))
            .param("q", query)
            .param("page", page);
        let data = match self.client.get_json(&req).await {
            Ok(Some(data)) => data,
            Ok(None) => return SourceOutcome::Blocked,
            Err(err) => {
                warn!(query, page, status = ?err.status(), "forum search API unavailable");
                return SourceOutcome::Blocked;
            }
        };
        if data.get("errors").is_some() {
            return SourceOutcome::Blocked;
        }
        SourceOutcome::from_items(
            topic_rows(&data)
                .into_iter()
                .filter_map(|row| {
                    Some(TopicRef {
                        id: topic_id(row)?,
                        title: str_field(row, &["title", "topic_title", "fancy_title"]),
                    })
                })
                .collect(),
        )
    }

    pub async fn search_html(&self, query: &str) -> SourceOutcome<TopicRef> {
        let Some(html) = self.html("/search", &[("q", query.to_string())]).await else {
            return SourceOutcome::Blocked;
        };
        SourceOutcome::from_items(
            topic_ids(&html)
                .into_iter()
                .map(|id| TopicRef { id, title: None })
                .collect(),
        )
    }

    /// One search page turned into evidence.
    #[instrument(skip(self))]
    pub async fn search_topics(&self, query: &str, page: usize) -> Vec<EvidenceItem> {
        let refs = match self.search_json(query, page).await {
            SourceOutcome::Found(refs) => refs,
            // The rendered search page has no paging; consult it once per query.
            _ if page > 0 => Vec::new(),
            outcome => {
                debug!(query, ?outcome, "search API gave nothing; scraping search page");
                self.search_html(query).await.into_items()
            }
        };
        self.topics(refs).await
    }

    /// Details for many topics, in input order.
    async fn topics(&self, refs: Vec<TopicRef>) -> Vec<EvidenceItem> {
        stream::iter(refs)
            .map(|r| self.topic(r))
            .buffered(self.cfg.concurrency.max(1))
            .filter_map(|item| async move { item })
            .collect()
            .await
    }

    async fn topic(&self, r: TopicRef) -> Option<EvidenceItem> {
        let path = format!("/t/{}.json", r.id);
        match self.json(&path, FetchRequest::new(self.url(&path))).await {
            Some(td) if td.is_object() => Some(self.topic_from_json(r, &td).await),
            _ => self.topic_from_html(r).await,
        }
    }

    async fn topic_from_json(&self, r: TopicRef, td: &Value) -> EvidenceItem {
        let topic = td.get("topic").unwrap_or(td);
        let posts_count = int_field(topic, &["posts_count"]).unwrap_or(0);
        let posters = topic
            .get("posters")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let posts = td
            .pointer("/post_stream/posts")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let unique_contributors = posters
            .iter()
            .filter_map(|p| int_field(p, &["user_id"]))
            .unique()
            .count() as i64;
        let likes: i64 = posts
            .iter()
            .filter_map(|p| int_field(p, &["like_count"]))
            .sum();
        let country = self.topic_country(posts, posters).await;

        let metrics = ForumMetrics {
            replies: Some((posts_count - 1).max(0)),
            likes: Some(likes),
            views: Some(int_field(topic, &["views"]).unwrap_or(0)),
            unique_contributors: Some(unique_contributors),
            first_post_ts: str_field(topic, &["created_at"]),
            last_post_ts: str_field(topic, &["bumped_at", "last_posted_at"]),
            country,
        };
        let title = r.title.or_else(|| str_field(topic, &["title", "fancy_title"]));
        self.evidence(r.id, title, metrics)
    }

    async fn topic_from_html(&self, r: TopicRef) -> Option<EvidenceItem> {
        let html = self.html(&format!("/t/{}", r.id), &[]).await?;
        let stats = topic_page_stats(&html);
        let metrics = ForumMetrics {
            replies: Some((stats.posts - 1).max(0)),
            likes: Some(stats.likes),
            views: Some(stats.views.unwrap_or(0)),
            ..Default::default()
        };
        debug!(topic = r.id, "topic metrics scraped from page");
        Some(self.evidence(r.id, r.title.or(stats.title), metrics))
    }

    /// First post author, then posters, then every post author.
    async fn topic_country(&self, posts: &[Value], posters: &[Value]) -> Option<String> {
        let first = posts
            .first()
            .and_then(|p| str_field(p, &["username", "name"]));
        let from_posters = posters.iter().filter_map(|p| {
            str_field(p, &["username"])
                .or_else(|| p.get("extras").and_then(|e| str_field(e, &["username"])))
        });
        let from_posts = posts.iter().filter_map(|p| str_field(p, &["username"]));
        let candidates: Vec<String> = first
            .into_iter()
            .chain(from_posters)
            .chain(from_posts)
            .unique()
            .collect();
        for user in candidates {
            if let Some(country) = self.user_country(&user).await {
                return Some(country);
            }
        }
        None
    }

    pub async fn user_country(&self, user: &str) -> Option<String> {
        if let Some(cached) = self.countries.get(user) {
            return cached;
        }
        let path = format!("/u/{user}.json");
        let inferred = self
            .json(&path, FetchRequest::new(self.url(&path)).max_retries(1))
            .await
            .and_then(|data| profile_text(&data))
            .and_then(|text| infer_country(&text))
            .map(str::to_string);
        self.countries.insert(user, inferred.clone());
        inferred
    }

    async fn topic_list(&self, path: &str) -> Vec<Value> {
        self.json(path, FetchRequest::new(self.url(path)))
            .await
            .map(|data| topic_rows(&data).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    fn from_list_row(&self, row: &Value) -> Option<(u64, EvidenceItem)> {
        let id = topic_id(row)?;
        let metrics = ForumMetrics {
            replies: int_field(row, &["posts_count", "posts"]).map(|n| (n - 1).max(0)),
            likes: Some(int_field(row, &["like_count", "like_counts"]).unwrap_or(0)),
            views: Some(int_field(row, &["views"]).unwrap_or(0)),
            ..Default::default()
        };
        let title = str_field(row, &["fancy_title", "title"]);
        Some((id, self.evidence(id, title, metrics)))
    }

    /// Recent topics: list endpoints first, then `pages` rendered `/latest`
    /// pages for ids the lists did not cover.
    #[instrument(skip(self))]
    pub async fn collect_recent(&self, pages: usize) -> Vec<EvidenceItem> {
        let mut rows = self.topic_list("/latest.json").await;
        if rows.is_empty() {
            rows = self.topic_list("/top.json").await;
        }
        let mut seen: HashSet<u64> = HashSet::new();
        let mut items: Vec<EvidenceItem> = rows
            .iter()
            .filter_map(|row| self.from_list_row(row))
            .filter(|(id, _)| seen.insert(*id))
            .map(|(_, item)| item)
            .collect();

        for page in 0..pages {
            let params = if page > 0 {
                vec![("page", page.to_string())]
            } else {
                Vec::new()
            };
            let Some(html) = self.html("/latest", &params).await else {
                continue;
            };
            let fresh: Vec<TopicRef> = topic_ids(&html)
                .into_iter()
                .filter(|id| seen.insert(*id))
                .map(|id| TopicRef { id, title: None })
                .collect();
            items.extend(self.topics(fresh).await);
        }
        info!(count = items.len(), "recent forum topics collected");
        items
    }
}

#[async_trait]
impl EvidenceCollector for ForumCollector {
    fn name(&self) -> &'static str {
        "forum"
    }

    fn concurrency(&self) -> usize {
        self.cfg.concurrency
    }

    async fn collect_query(&self, query: &str) -> Vec<EvidenceItem> {
        let mut items = Vec::new();
        for page in 0..self.cfg.max_pages {
            let found = self.search_topics(query, page).await;
            if found.is_empty() {
                break;
            }
            items.extend(found);
        }
        items
    }

    /// Search every query; if nothing at all turns up, filter recent topics by
    /// query substring instead. First occurrence of a topic wins.
    async fn collect_all(&self, queries: &[String]) -> Vec<EvidenceItem> {
        let mut items: Vec<EvidenceItem> = self.collect(queries).collect().await;
        if items.is_empty() && !queries.is_empty() {
            info!("forum search found nothing; filtering recent topics");
            let needles: Vec<String> = queries.iter().map(|q| q.to_lowercase()).collect();
            items = self
                .collect_recent(self.cfg.max_pages * 2)
                .await
                .into_iter()
                .filter(|t| {
                    let title = t.title.as_deref().unwrap_or_default().to_lowercase();
                    needles.iter().any(|q| title.contains(q.as_str()))
                })
                .collect();
        }
        items
            .into_iter()
            .unique_by(|i| i.source_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{client_for, MockTransport};
    use serde_json::json;
    use std::sync::Arc;

    const BASE: &str = "https://forum.test";

    fn u(path: &str) -> String {
        format!("{BASE}{path}")
    }

    fn cfg() -> ForumConfig {
        ForumConfig {
            base_url: BASE.into(),
            api_key: Some("secret".into()),
            api_user: Some("system".into()),
            max_pages: 1,
            concurrency: 1,
            html_retries: 0,
            ..Default::default()
        }
    }

    fn collector(mock: &Arc<MockTransport>) -> ForumCollector {
        ForumCollector::new(client_for(mock.clone()), cfg())
    }

    fn topic_json(id: u64, title: &str, authors: &[&str]) -> String {
        let posts: Vec<Value> = authors
            .iter()
            .enumerate()
            .map(|(i, a)| json!({"username": a, "like_count": i + 2}))
            .collect();
        json!({
            "id": id,
            "title": title,
            "posts_count": authors.len(),
            "views": 100,
            "created_at": "2025-01-01T00:00:00Z",
            "last_posted_at": "2025-01-03T00:00:00Z",
            "posters": [{"user_id": 1}, {"user_id": 2}, {"user_id": 1}],
            "post_stream": {"posts": posts}
        })
        .to_string()
    }

    #[tokio::test]
    async fn search_api_then_topic_detail_with_country() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 200, r#"{"topics":[{"id":42,"title":"Slack alerts"}]}"#)
                .on(&u("/t/42.json"), 200, &topic_json(42, "ignored", &["alice", "bob"]))
                .on(&u("/u/alice.json"), 200, r#"{"user":{"location":"Mumbai, India"}}"#),
        );
        let items = collector(&mock).collect_query("slack").await;
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.source_id, "discourse:42");
        assert_eq!(item.source_url.as_deref(), Some("https://forum.test/t/42"));
        assert_eq!(item.title.as_deref(), Some("Slack alerts"));
        let PlatformMetrics::Forum(m) = &item.metrics else {
            panic!("forum metrics expected");
        };
        assert_eq!(m.replies, Some(1));
        assert_eq!(m.likes, Some(5));
        assert_eq!(m.views, Some(100));
        assert_eq!(m.unique_contributors, Some(2));
        assert_eq!(m.first_post_ts.as_deref(), Some("2025-01-01T00:00:00Z"));
        assert_eq!(m.country.as_deref(), Some("IN"));

        let search = &mock.calls()[0];
        assert_eq!(search.param("q"), Some("slack"));
        assert_eq!(search.param("page"), Some("0"));
        assert_eq!(search.header("Api-Key"), Some("secret"));
        assert_eq!(search.header("Api-Username"), Some("system"));
        assert_eq!(mock.calls_to(&u("/u/bob.json")), 0);
    }

    #[tokio::test]
    async fn denied_search_falls_back_to_page_links() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 403, "denied")
                .on(&u("/search"), 200, r#"<a href="/t/webhook-retries/7">x</a>"#)
                .on(&u("/t/7.json"), 200, &topic_json(7, "Webhook retries", &["carol"])),
        );
        let items = collector(&mock).collect_query("webhook").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("Webhook retries"));
        assert_eq!(items[0].metrics.country(), None);
        let page = mock.calls().into_iter().find(|c| c.url == u("/search")).unwrap();
        assert_eq!(page.header("Accept"), Some("text/html"));
    }

    #[tokio::test]
    async fn blocked_topic_json_uses_rendered_page() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 200, r#"{"topics":[{"topic_id":9}]}"#)
                .on(&u("/t/9.json"), 403, "denied")
                .on(
                    &u("/t/9"),
                    200,
                    r#"<meta property="og:title" content="Gmail digest">
                       <div data-post-id="1"></div><div data-post-id="2"></div>
                       <span>2,500 views</span><span class="like-count">7</span>"#,
                ),
        );
        let items = collector(&mock).collect_query("gmail").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("Gmail digest"));
        assert_eq!(items[0].metrics.views(), Some(2500));
        assert_eq!(items[0].metrics.likes(), Some(7));
        assert_eq!(items[0].metrics.comments_or_replies(), Some(1));
    }

    #[tokio::test]
    async fn country_lookups_are_cached_per_user() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 200, r#"{"topics":[{"id":1},{"id":2}]}"#)
                .on(&u("/t/1.json"), 200, &topic_json(1, "One", &["dave"]))
                .on(&u("/t/2.json"), 200, &topic_json(2, "Two", &["dave"]))
                .on(&u("/u/dave.json"), 200, r#"{"user":{"user_fields":{"1":"Berlin"}}}"#),
        );
        let items = collector(&mock).collect_query("x").await;
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.metrics.country() == Some("DE")));
        assert_eq!(mock.calls_to(&u("/u/dave.json")), 1);
    }

    #[tokio::test]
    async fn empty_search_falls_back_to_recent_topics_filtered_by_query() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 200, r#"{"topics":[]}"#)
                .on(
                    &u("/latest.json"),
                    200,
                    r#"{"topic_list":{"topics":[
                        {"id":1,"fancy_title":"Slack bot","posts_count":4,"views":10,"like_count":1},
                        {"id":2,"title":"Unrelated"}
                    ]}}"#,
                )
                .on(&u("/latest"), 200, r#"<a href="/t/x/1">a</a><a href="/t/slack-digest/3">b</a>"#)
                .on(&u("/t/3.json"), 200, &topic_json(3, "SLACK digest", &[])),
        );
        let c = collector(&mock);
        let queries = vec!["slack".to_string()];
        let items = c.collect_all(&queries).await;
        let ids: Vec<&str> = items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["discourse:1", "discourse:3"]);
        assert_eq!(items[0].metrics.comments_or_replies(), Some(3));
        assert_eq!(mock.calls_to(&u("/top.json")), 0);
        assert_eq!(mock.calls_to(&u("/t/1.json")), 0);
    }

    #[tokio::test]
    async fn overlapping_queries_yield_each_topic_once() {
        let mock = Arc::new(
            MockTransport::new()
                .on(&u("/search.json"), 200, r#"{"topics":[{"id":5,"title":"Shared"}]}"#)
                .on(&u("/t/5.json"), 200, &topic_json(5, "Shared", &[])),
        );
        let queries = vec!["a".to_string(), "b".to_string()];
        let items = collector(&mock).collect_all(&queries).await;
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn profile_text_prefers_location() {
        let v = json!({"user": {"location": "Toronto", "bio_raw": "from Paris"}});
        assert_eq!(profile_text(&v).as_deref(), Some("Toronto"));
        let v = json!({"bio_raw": "  ", "user_fields": {"1": "", "2": "Sydney"}});
        assert_eq!(profile_text(&v).as_deref(), Some("Sydney"));
        assert_eq!(profile_text(&json!({"user": {}})), None);
    }
}

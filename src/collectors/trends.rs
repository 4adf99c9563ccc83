//! Search-interest collector.
//!
//! Per (keyword, region): `explore` hands out widget tokens, then
//! `widgetdata/multiline` gives interest over time, `widgetdata/comparedgeo`
//! the regional breakdown and `widgetdata/relatedsearches` related queries.
//! Bodies carry a `)]}'` anti-JSON prefix. The service rate limits hard, so
//! requests are paced and a 429 backs off before the next attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use super::EvidenceCollector;
use crate::config::TrendsConfig;
use crate::fetch::{truncate_for_log, FetchClient, FetchRequest};
use crate::models::lenient::coerce_f64;
use crate::models::{EvidenceItem, Platform, PlatformMetrics, TrendMetrics, TrendPoint};

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// `(last - prev) / max(1, prev)`, or 0 when there is no previous interest.
pub fn growth_ratio(last: f64, prev: f64) -> f64 {
    if prev != 0.0 {
        (last - prev) / prev.max(1.0)
    } else {
        0.0
    }
}

/// Rolling window averages over an interest series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrowthWindows {
    pub last30: f64,
    pub prev30: f64,
    pub last60: f64,
    pub prev60: f64,
}

impl GrowthWindows {
    pub fn from_series(vals: &[f64]) -> Self {
        let n = vals.len();
        if n >= 60 {
            let last60 = mean(&vals[n - 60..]);
            Self {
                last30: mean(&vals[n - 30..]),
                prev30: mean(&vals[n - 60..n - 30]),
                last60,
                prev60: if n > 60 { mean(&vals[..n - 60]) } else { last60 },
            }
        } else if n >= 30 {
            let last30 = mean(&vals[n - 30..]);
            let prev30 = mean(&vals[..n - 30]);
            Self {
                last30,
                prev30,
                last60: last30,
                prev60: prev30,
            }
        } else {
            let all = mean(vals);
            Self {
                last30: all,
                prev30: all,
                last60: all,
                prev60: all,
            }
        }
    }

    pub fn growth_30d(&self) -> f64 {
        growth_ratio(self.last30, self.prev30)
    }

    pub fn growth_60d(&self) -> f64 {
        growth_ratio(self.last60, self.prev60)
    }
}

/// Mean of the anchor's last 30 points (all of them when shorter).
pub fn anchor_average(vals: &[f64]) -> Option<f64> {
    match vals.len() {
        0 => None,
        n if n >= 30 => Some(mean(&vals[n - 30..])),
        _ => Some(mean(vals)),
    }
}

/// Relative interest scaled by the anchor's known absolute volume.
pub fn monthly_estimate(last30: f64, anchor_volume: f64, anchor_avg: f64) -> Option<i64> {
    if anchor_avg <= 0.0 || !anchor_avg.is_finite() {
        return None;
    }
    let est = (last30 * anchor_volume / anchor_avg).floor();
    est.is_finite().then_some(est.max(0.0) as i64)
}

/// Strip the anti-JSON prefix (`)]}'` optionally followed by a comma).
fn parse_prefixed(body: &str) -> Option<Value> {
    let trimmed = body.trim_start();
    let rest = trimmed
        .strip_prefix(")]}'")
        .map(|r| r.trim_start_matches(','))
        .unwrap_or(trimmed);
    serde_json::from_str(rest.trim_start()).ok()
}

#[derive(Debug)]
enum PairError {
    RateLimited,
    Failed(String),
}

#[derive(Debug, Clone)]
struct Widget {
    id: String,
    token: String,
    request: Value,
}

#[derive(Debug, Clone, Default)]
struct Widgets {
    timeseries: Option<Widget>,
    geo: Option<Widget>,
    related: Option<Widget>,
}

pub struct TrendsCollector {
    client: FetchClient,
    cfg: TrendsConfig,
    anchor_avg: OnceCell<Option<f64>>,
}

impl TrendsCollector {
    pub fn new(client: FetchClient, cfg: TrendsConfig) -> Self {
        let client = client.with_default_header("User-Agent", &cfg.user_agent);
        Self {
            client,
            cfg,
            anchor_avg: OnceCell::new(),
        }
    }

    async fn pace(&self) {
        let (lo, hi) = self.cfg.pacing;
        if hi.is_zero() {
            return;
        }
        let ms = rand::thread_rng().gen_range(lo.as_millis() as u64..=hi.as_millis().max(lo.as_millis()) as u64);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    /// One GET without client-side retries; the attempt loop lives in `collect_pair`.
    async fn call(&self, endpoint: &str, params: Vec<(&str, String)>) -> Result<Value, PairError> {
        let url = format!("{}/{}", self.cfg.api_base, endpoint);
        let req = params
            .into_iter()
            .fold(FetchRequest::new(&url), |req, (k, v)| req.param(k, v))
            .param("hl", &self.cfg.hl)
            .param("tz", self.cfg.tz)
            .max_retries(0);
        match self.client.get_text(&req).await {
            Ok(Some(body)) => parse_prefixed(&body).ok_or_else(|| {
                PairError::Failed(format!("unparseable body: {}", truncate_for_log(&body, 120)))
            }),
            Ok(None) => Err(PairError::RateLimited),
            Err(err) if err.status() == Some(429) => Err(PairError::RateLimited),
            Err(err) => Err(PairError::Failed(err.to_string())),
        }
    }

    async fn explore(&self, keyword: &str, geo: &str) -> Result<Widgets, PairError> {
        let req = json!({
            "comparisonItem": [{"keyword": keyword, "time": self.cfg.timeframe, "geo": geo}],
            "category": 0,
            "property": ""
        });
        let data = self.call("explore", vec![("req", req.to_string())]).await?;
        let mut widgets = Widgets::default();
        for w in data.get("widgets").and_then(Value::as_array).into_iter().flatten() {
            let (Some(id), Some(token)) = (
                w.get("id").and_then(Value::as_str),
                w.get("token").and_then(Value::as_str),
            ) else {
                continue;
            };
            let widget = Widget {
                id: id.to_string(),
                token: token.to_string(),
                request: w.get("request").cloned().unwrap_or_else(|| json!({})),
            };
            match id {
                "TIMESERIES" => widgets.timeseries = Some(widget),
                "GEO_MAP" => widgets.geo = Some(widget),
                _ if id.starts_with("RELATED_QUERIES") => widgets.related = Some(widget),
                _ => {}
            }
        }
        Ok(widgets)
    }

    async fn widget_data(&self, endpoint: &str, widget: &Widget) -> Result<Value, PairError> {
        debug!(endpoint, widget = %widget.id, "widget data");
        self.call(
            &format!("widgetdata/{endpoint}"),
            vec![
                ("req", widget.request.to_string()),
                ("token", widget.token.clone()),
            ],
        )
        .await
    }

    async fn interest_over_time(&self, widget: &Widget) -> Result<Vec<TrendPoint>, PairError> {
        let data = self.widget_data("multiline", widget).await?;
        let rows = data
            .pointer("/default/timelineData")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(rows
            .iter()
            .filter_map(|row| {
                let value = row.pointer("/value/0").and_then(coerce_f64)?;
                let date = row
                    .get("time")
                    .and_then(|t| t.as_str().and_then(|s| s.parse::<i64>().ok()).or(t.as_i64()))
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .map(|dt| dt.format("%Y-%m-%d").to_string())
                    .or_else(|| row.get("formattedTime").and_then(Value::as_str).map(str::to_string))?;
                Some(TrendPoint { date, value })
            })
            .collect())
    }

    async fn interest_by_region(&self, widget: &Widget) -> Result<BTreeMap<String, f64>, PairError> {
        let mut widget = widget.clone();
        if let Some(req) = widget.request.as_object_mut() {
            req.insert("resolution".into(), json!("COUNTRY"));
            req.insert("includeLowSearchVolumeGeos".into(), json!(true));
        }
        let data = self.widget_data("comparedgeo", &widget).await?;
        Ok(data
            .pointer("/default/geoMapData")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|row| {
                let key = row
                    .get("geoCode")
                    .or_else(|| row.get("geoName"))
                    .and_then(Value::as_str)?;
                let value = row.pointer("/value/0").and_then(coerce_f64)?;
                Some((key.to_string(), value))
            })
            .collect())
    }

    async fn related_queries(&self, widget: &Widget) -> Result<Vec<String>, PairError> {
        let data = self.widget_data("relatedsearches", widget).await?;
        Ok(data
            .pointer("/default/rankedList")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|list| list.get("rankedKeyword").and_then(Value::as_array))
            .flatten()
            .filter_map(|kw| kw.get("query").and_then(Value::as_str).map(str::to_string))
            .unique()
            .collect())
    }

    /// Average interest of the anchor keyword, fetched once per collector.
    async fn anchor_avg(&self) -> Option<f64> {
        *self
            .anchor_avg
            .get_or_init(|| async {
                let anchor = self.cfg.anchor.as_ref()?;
                let geo = self.cfg.geos.first().map(String::as_str).unwrap_or("US");
                let widgets = self.explore(&anchor.keyword, geo).await.ok()?;
                let points = self.interest_over_time(widgets.timeseries.as_ref()?).await.ok()?;
                let vals: Vec<f64> = points.iter().map(|p| p.value).collect();
                let avg = anchor_average(&vals);
                info!(keyword = %anchor.keyword, ?avg, "trend anchor calibrated");
                avg
            })
            .await
    }

    async fn fetch_pair(&self, keyword: &str, geo: &str) -> Result<Option<EvidenceItem>, PairError> {
        let widgets = self.explore(keyword, geo).await?;
        let Some(ts) = widgets.timeseries.as_ref() else {
            return Ok(None);
        };
        let series = self.interest_over_time(ts).await?;
        if series.is_empty() {
            return Ok(None);
        }

        let interest_by_region = match widgets.geo.as_ref() {
            Some(w) => self.interest_by_region(w).await.unwrap_or_else(|e| {
                warn!(keyword, geo, error = ?e, "regional interest unavailable");
                BTreeMap::new()
            }),
            None => BTreeMap::new(),
        };
        let related_queries = match widgets.related.as_ref() {
            Some(w) => self.related_queries(w).await.unwrap_or_else(|e| {
                debug!(keyword, geo, error = ?e, "related queries unavailable");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let vals: Vec<f64> = series.iter().map(|p| p.value).collect();
        let windows = GrowthWindows::from_series(&vals);
        let monthly_search_estimate = match (&self.cfg.anchor, self.anchor_avg().await) {
            (Some(anchor), Some(avg)) => monthly_estimate(windows.last30, anchor.volume, avg),
            _ => None,
        };

        let country = (!geo.is_empty()).then(|| geo.to_string());
        let metrics = TrendMetrics {
            interest_over_time: series,
            interest_by_region,
            related_queries,
            growth_pct_30d: Some(windows.growth_30d()),
            growth_pct_60d: Some(windows.growth_60d()),
            monthly_search_estimate,
            country,
        };
        Ok(Some(
            EvidenceItem::new(
                Platform::Trends,
                format!("trends:{keyword}:{geo}"),
                PlatformMetrics::Trends(metrics),
            )
            .with_keyword(keyword),
        ))
    }

    /// Up to `attempts` tries; a rate limit sleeps and doubles the backoff.
    #[instrument(skip(self))]
    pub async fn collect_pair(&self, keyword: &str, geo: &str) -> Option<EvidenceItem> {
        let mut backoff = self.cfg.rate_limit_backoff;
        for attempt in 1..=self.cfg.attempts.max(1) {
            self.pace().await;
            match self.fetch_pair(keyword, geo).await {
                Ok(Some(item)) => return Some(item),
                Ok(None) => {
                    debug!(keyword, geo, "no interest data");
                    return None;
                }
                Err(PairError::RateLimited) => {
                    warn!(
                        keyword,
                        geo,
                        attempt,
                        attempts = self.cfg.attempts,
                        backoff_secs = backoff.as_secs_f64(),
                        "trends rate limited"
                    );
                    if attempt < self.cfg.attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
                Err(PairError::Failed(msg)) => {
                    warn!(keyword, geo, error = %msg, "trends request failed");
                    return None;
                }
            }
        }
        None
    }
}

#[async_trait]
impl EvidenceCollector for TrendsCollector {
    fn name(&self) -> &'static str {
        "trends"
    }

    fn concurrency(&self) -> usize {
        self.cfg.concurrency
    }

    async fn collect_query(&self, query: &str) -> Vec<EvidenceItem> {
        let mut items = Vec::new();
        for geo in &self.cfg.geos {
            if let Some(item) = self.collect_pair(query, geo).await {
                items.push(item);
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrendsAnchor;
    use crate::testing::{client_for, MockTransport};
    use std::sync::Arc;

    const EXPLORE: &str = "https://trends.test/api/explore";
    const MULTILINE: &str = "https://trends.test/api/widgetdata/multiline";
    const GEO: &str = "https://trends.test/api/widgetdata/comparedgeo";
    const RELATED: &str = "https://trends.test/api/widgetdata/relatedsearches";

    fn cfg() -> TrendsConfig {
        TrendsConfig {
            api_base: "https://trends.test/api".into(),
            rate_limit_backoff: Duration::ZERO,
            pacing: (Duration::ZERO, Duration::ZERO),
            ..Default::default()
        }
    }

    fn explore_body() -> String {
        format!(
            ")]}}'\n{}",
            json!({"widgets": [
                {"id": "TIMESERIES", "token": "t-ts", "request": {"time": "today 3-m"}},
                {"id": "GEO_MAP", "token": "t-geo", "request": {"geo": {}}},
                {"id": "RELATED_QUERIES", "token": "t-rel", "request": {}}
            ]})
        )
    }

    fn timeline(values: &[f64]) -> String {
        let start = 1_735_689_600i64; // 2025-01-01
        let rows: Vec<Value> = values
            .iter()
            .enumerate()
            .map(|(i, v)| json!({"time": (start + i as i64 * 86_400).to_string(), "value": [v]}))
            .collect();
        format!(")]}}',\n{}", json!({"default": {"timelineData": rows}}))
    }

    fn full_mock(values: &[f64]) -> MockTransport {
        MockTransport::new()
            .on(EXPLORE, 200, &explore_body())
            .on(MULTILINE, 200, &timeline(values))
            .on(
                GEO,
                200,
                r#")]}',{"default":{"geoMapData":[{"geoCode":"IN","geoName":"India","value":[100]},{"geoName":"Nowhere","value":["n/a"]}]}}"#,
            )
            .on(
                RELATED,
                200,
                r#")]}',{"default":{"rankedList":[{"rankedKeyword":[{"query":"n8n slack bot"}]},{"rankedKeyword":[{"query":"n8n slack bot"},{"query":"slack webhook"}]}]}}"#,
            )
    }

    #[test]
    fn windows_with_long_series() {
        let mut vals = vec![10.0; 30];
        vals.extend(vec![20.0; 30]);
        vals.extend(vec![40.0; 30]);
        let w = GrowthWindows::from_series(&vals);
        assert_eq!((w.last30, w.prev30, w.last60, w.prev60), (40.0, 20.0, 30.0, 10.0));
        assert_eq!(w.growth_30d(), 1.0);
        assert_eq!(w.growth_60d(), 2.0);
    }

    #[test]
    fn windows_with_medium_and_short_series() {
        let mut vals = vec![10.0; 15];
        vals.extend(vec![20.0; 30]);
        let w = GrowthWindows::from_series(&vals);
        assert_eq!(w.growth_30d(), 1.0);
        assert_eq!(w.growth_60d(), w.growth_30d());

        let w = GrowthWindows::from_series(&[1.0, 2.0, 3.0]);
        assert_eq!(w.last30, 2.0);
        assert_eq!(w.growth_30d(), 0.0);

        let w = GrowthWindows::from_series(&[]);
        assert_eq!(w.growth_30d(), 0.0);
    }

    #[test]
    fn growth_ratio_floors_small_denominators() {
        assert_eq!(growth_ratio(1.0, 0.5), 0.5);
        assert_eq!(growth_ratio(5.0, 0.0), 0.0);
        assert_eq!(growth_ratio(10.0, 20.0), -0.5);
    }

    #[test]
    fn anchor_scaling() {
        let mut vals = vec![100.0; 10];
        vals.extend(vec![50.0; 30]);
        assert_eq!(anchor_average(&vals), Some(50.0));
        assert_eq!(anchor_average(&[4.0, 6.0]), Some(5.0));
        assert_eq!(anchor_average(&[]), None);
        assert_eq!(monthly_estimate(25.0, 10_000.0, 50.0), Some(5000));
        assert_eq!(monthly_estimate(25.0, 10_000.0, 0.0), None);
        assert_eq!(monthly_estimate(-3.0, 10.0, 1.0), Some(0));
    }

    #[test]
    fn strips_anti_json_prefix() {
        assert_eq!(parse_prefixed(")]}'\n{\"a\":1}"), Some(json!({"a": 1})));
        assert_eq!(parse_prefixed(")]}',\n[1]"), Some(json!([1])));
        assert_eq!(parse_prefixed("{\"b\":2}"), Some(json!({"b": 2})));
        assert_eq!(parse_prefixed("<html>"), None);
    }

    #[tokio::test]
    async fn collects_series_regions_and_related_queries() {
        let mock = Arc::new(full_mock(&[10.0, 20.0, 30.0]));
        let c = TrendsCollector::new(client_for(mock.clone()), cfg());
        let items = c.collect_query("n8n slack").await;
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.source_id, "trends:n8n slack:US");
        assert_eq!(item.keyword.as_deref(), Some("n8n slack"));
        assert_eq!(item.platform, Platform::Trends);
        let PlatformMetrics::Trends(m) = &item.metrics else {
            panic!("trend metrics expected");
        };
        assert_eq!(m.interest_over_time.len(), 3);
        assert_eq!(m.interest_over_time[0].date, "2025-01-01");
        assert_eq!(m.interest_by_region.get("IN"), Some(&100.0));
        assert_eq!(m.interest_by_region.len(), 1);
        assert_eq!(m.related_queries, vec!["n8n slack bot", "slack webhook"]);
        assert_eq!(m.growth_pct_30d, Some(0.0));
        assert_eq!(m.country.as_deref(), Some("US"));
        assert_eq!(m.monthly_search_estimate, None);

        let calls = mock.calls();
        let explore = calls.iter().find(|c| c.url == EXPLORE).unwrap();
        assert!(explore.param("req").unwrap().contains("\"n8n slack\""));
        assert_eq!(explore.param("hl"), Some("en-US"));
        let geo = calls.iter().find(|c| c.url == GEO).unwrap();
        assert_eq!(geo.param("token"), Some("t-geo"));
        assert!(geo.param("req").unwrap().contains("COUNTRY"));
        assert!(explore.header("User-Agent").unwrap().starts_with("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn rate_limits_back_off_then_succeed() {
        let mock = Arc::new(
            MockTransport::new()
                .on(EXPLORE, 429, "")
                .on(EXPLORE, 429, "")
                .on(EXPLORE, 200, &explore_body())
                .on(MULTILINE, 200, &timeline(&[5.0])),
        );
        let c = TrendsCollector::new(client_for(mock.clone()), cfg());
        assert!(c.collect_pair("zapier", "US").await.is_some());
        assert_eq!(mock.calls_to(EXPLORE), 3);
    }

    #[tokio::test]
    async fn persistent_rate_limit_gives_up_after_attempt_budget() {
        let mock = Arc::new(MockTransport::new().on(EXPLORE, 429, ""));
        let c = TrendsCollector::new(client_for(mock.clone()), cfg());
        assert!(c.collect_query("zapier").await.is_empty());
        assert_eq!(mock.calls_to(EXPLORE), 4);
    }

    #[tokio::test]
    async fn missing_series_yields_no_item() {
        let mock = Arc::new(
            MockTransport::new()
                .on(EXPLORE, 200, &explore_body())
                .on(MULTILINE, 200, r#")]}',{"default":{"timelineData":[]}}"#),
        );
        let c = TrendsCollector::new(client_for(mock.clone()), cfg());
        assert!(c.collect_query("obscure").await.is_empty());
        assert_eq!(mock.calls_to(GEO), 0);
    }

    #[tokio::test]
    async fn anchor_converts_interest_to_volume() {
        let mock = Arc::new(full_mock(&[40.0; 30]));
        let cfg = TrendsConfig {
            anchor: Some(TrendsAnchor {
                keyword: "anchor".into(),
                volume: 1000.0,
            }),
            geos: vec!["US".into(), "IN".into()],
            ..cfg()
        };
        let c = TrendsCollector::new(client_for(mock.clone()), cfg);
        let items = c.collect_query("n8n").await;
        assert_eq!(items.len(), 2);
        for item in &items {
            let PlatformMetrics::Trends(m) = &item.metrics else {
                panic!("trend metrics expected");
            };
            // Same interest as the anchor, so the anchor's volume comes back.
            assert_eq!(m.monthly_search_estimate, Some(1000));
        }
        assert_eq!(items[1].source_id, "trends:n8n:IN");
        // Anchor explore happens once: 2 pairs + 1 calibration.
        assert_eq!(mock.calls_to(EXPLORE), 3);
    }
}

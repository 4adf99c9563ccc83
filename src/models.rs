//! Evidence and canonical workflow records.
//!
//! Metrics are typed per platform (`PlatformMetrics`) but every accessor treats
//! its field as optional; numeric fields decode leniently so that hand-edited or
//! scraped raw files with `"views": "1,234"` or `"views": "n/a"` still load.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Video,
    Forum,
    Trends,
    TrendsSynthetic,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Video => "YouTube",
            Platform::Forum => "Discourse",
            Platform::Trends => "GoogleTrends",
            Platform::TrendsSynthetic => "GoogleTrendsSynthetic",
        }
    }

    /// Case-insensitive; accepts both the source names and the generic aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "youtube" | "video" | "videoplatform" => Some(Platform::Video),
            "discourse" | "forum" | "forumplatform" => Some(Platform::Forum),
            "googletrends" | "trends" | "trendsplatform" => Some(Platform::Trends),
            "googletrendssynthetic" | "trendssynthetic" | "trendssynth" => {
                Some(Platform::TrendsSynthetic)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::parse(s).ok_or_else(|| format!("unknown platform {s:?}"))
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Platform::parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("unknown platform {raw:?}")))
    }
}

/// Numeric coercion shared by the metric decoders and the aggregator.
pub mod lenient {
    use super::TrendPoint;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;
    use std::collections::BTreeMap;

    pub fn coerce_f64(v: &Value) -> Option<f64> {
        let f = match v {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().replace(',', "").parse::<f64>().ok()?,
            _ => return None,
        };
        f.is_finite().then_some(f)
    }

    pub fn coerce_i64(v: &Value) -> Option<i64> {
        if let Some(n) = v.as_i64() {
            return Some(n);
        }
        if let Value::String(s) = v {
            if let Ok(n) = s.trim().replace(',', "").parse::<i64>() {
                return Some(n);
            }
        }
        coerce_f64(v).map(|f| f as i64)
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(coerce_i64))
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().and_then(coerce_f64))
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
            _ => None,
        })
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(match v {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|it| match it {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    pub fn series<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<TrendPoint>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        Ok(v.as_ref().map(series_from_value).unwrap_or_default())
    }

    pub fn region_map<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeMap<String, f64>, D::Error> {
        let v = Option::<Value>::deserialize(d)?;
        let Some(Value::Object(map)) = v else {
            return Ok(BTreeMap::new());
        };
        // Column-oriented dumps nest the values one level down: {keyword: {region: value}}.
        let nested = map.values().find_map(|v| v.as_object().cloned());
        let flat = nested.unwrap_or(map);
        Ok(flat
            .iter()
            .filter_map(|(k, v)| coerce_f64(v).map(|f| (k.clone(), f)))
            .collect())
    }

    /// Accepts `[n, ..]`, `[{date, value}, ..]`, `{date: n}` and the column
    /// shape `{keyword: {date: n}, isPartial: {..}}`.
    pub fn series_from_value(v: &Value) -> Vec<TrendPoint> {
        match v {
            Value::Array(items) => items
                .iter()
                .enumerate()
                .filter_map(|(i, it)| match it {
                    Value::Object(o) => {
                        let value = o.get("value").and_then(coerce_f64)?;
                        let date = o
                            .get("date")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .unwrap_or_else(|| i.to_string());
                        Some(TrendPoint { date, value })
                    }
                    other => coerce_f64(other).map(|value| TrendPoint {
                        date: i.to_string(),
                        value,
                    }),
                })
                .collect(),
            Value::Object(map) => {
                let column = map
                    .iter()
                    .find(|(k, v)| k.as_str() != "isPartial" && v.is_object())
                    .map(|(_, v)| v);
                let points = match column {
                    Some(Value::Object(points)) => points,
                    _ => map,
                };
                points
                    .iter()
                    .filter_map(|(date, val)| {
                        coerce_f64(val).map(|value| TrendPoint {
                            date: date.clone(),
                            value,
                        })
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}

/// RFC 3339 first, then naive date-times (assumed UTC), then bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoMetrics {
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub views: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub likes: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub comments: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ForumMetrics {
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub replies: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub likes: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub views: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_i64", skip_serializing_if = "Option::is_none")]
    pub unique_contributors: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub first_post_ts: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub last_post_ts: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendMetrics {
    #[serde(default, deserialize_with = "lenient::series")]
    pub interest_over_time: Vec<TrendPoint>,
    #[serde(default, deserialize_with = "lenient::region_map", skip_serializing_if = "BTreeMap::is_empty")]
    pub interest_by_region: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient::string_list", skip_serializing_if = "Vec::is_empty")]
    pub related_queries: Vec<String>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub growth_pct_30d: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub growth_pct_60d: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_i64")]
    pub monthly_search_estimate: Option<i64>,
    #[serde(default, deserialize_with = "lenient::opt_string", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

/// Per-platform metric shapes. Serialized without a tag: the owning
/// `EvidenceItem::platform` selects the shape on the way back in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PlatformMetrics {
    Video(VideoMetrics),
    Forum(ForumMetrics),
    Trends(TrendMetrics),
}

impl PlatformMetrics {
    pub fn empty_for(platform: Platform) -> Self {
        match platform {
            Platform::Video => PlatformMetrics::Video(VideoMetrics::default()),
            Platform::Forum => PlatformMetrics::Forum(ForumMetrics::default()),
            Platform::Trends | Platform::TrendsSynthetic => {
                PlatformMetrics::Trends(TrendMetrics::default())
            }
        }
    }

    pub fn from_value(platform: Platform, value: Value) -> Result<Self, serde_json::Error> {
        if value.is_null() {
            return Ok(Self::empty_for(platform));
        }
        Ok(match platform {
            Platform::Video => PlatformMetrics::Video(serde_json::from_value(value)?),
            Platform::Forum => PlatformMetrics::Forum(serde_json::from_value(value)?),
            Platform::Trends | Platform::TrendsSynthetic => {
                PlatformMetrics::Trends(serde_json::from_value(value)?)
            }
        })
    }

    pub fn views(&self) -> Option<i64> {
        match self {
            PlatformMetrics::Video(m) => m.views,
            PlatformMetrics::Forum(m) => m.views,
            PlatformMetrics::Trends(_) => None,
        }
    }

    pub fn likes(&self) -> Option<i64> {
        match self {
            PlatformMetrics::Video(m) => m.likes,
            PlatformMetrics::Forum(m) => m.likes,
            PlatformMetrics::Trends(_) => None,
        }
    }

    /// Comments for video items, replies for forum topics.
    pub fn comments_or_replies(&self) -> Option<i64> {
        match self {
            PlatformMetrics::Video(m) => m.comments,
            PlatformMetrics::Forum(m) => m.replies,
            PlatformMetrics::Trends(_) => None,
        }
    }

    pub fn country(&self) -> Option<&str> {
        match self {
            PlatformMetrics::Video(m) => m.country.as_deref(),
            PlatformMetrics::Forum(m) => m.country.as_deref(),
            PlatformMetrics::Trends(m) => m.country.as_deref(),
        }
    }

    pub fn set_country(&mut self, country: Option<String>) {
        match self {
            PlatformMetrics::Video(m) => m.country = country,
            PlatformMetrics::Forum(m) => m.country = country,
            PlatformMetrics::Trends(m) => m.country = country,
        }
    }

    /// Publication time for videos, first post time for topics.
    pub fn recency_ts(&self) -> Option<&str> {
        match self {
            PlatformMetrics::Video(m) => m.published_at.as_deref(),
            PlatformMetrics::Forum(m) => m.first_post_ts.as_deref(),
            PlatformMetrics::Trends(_) => None,
        }
    }

    pub fn growth_pct_30d(&self) -> Option<f64> {
        match self {
            PlatformMetrics::Trends(m) => m.growth_pct_30d,
            _ => None,
        }
    }

    pub fn interest_mean(&self) -> Option<f64> {
        match self {
            PlatformMetrics::Trends(m) if !m.interest_over_time.is_empty() => {
                let sum: f64 = m.interest_over_time.iter().map(|p| p.value).sum();
                Some(sum / m.interest_over_time.len() as f64)
            }
            _ => None,
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// One observation of a workflow from one source at one time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEvidenceItem")]
pub struct EvidenceItem {
    pub platform: Platform,
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    pub metrics: PlatformMetrics,
    pub scrape_ts: Option<DateTime<Utc>>,
}

impl EvidenceItem {
    pub fn new(platform: Platform, source_id: impl Into<String>, metrics: PlatformMetrics) -> Self {
        Self {
            platform,
            source_id: source_id.into(),
            source_url: None,
            title: None,
            keyword: None,
            metrics,
            scrape_ts: Some(Utc::now()),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn with_title(mut self, title: Option<String>) -> Self {
        self.title = title.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn with_keyword(mut self, keyword: impl Into<String>) -> Self {
        self.keyword = Some(keyword.into());
        self
    }

    /// Title, else the trend keyword, used for grouping and display votes.
    pub fn label(&self) -> Option<&str> {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .or(self.keyword.as_deref().filter(|k| !k.trim().is_empty()))
    }
}

#[derive(Deserialize)]
struct RawEvidenceItem {
    platform: String,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    source_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    source_url: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    keyword: Option<String>,
    #[serde(default)]
    metrics: Value,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    scrape_ts: Option<String>,
    #[serde(default, deserialize_with = "lenient::opt_string")]
    country: Option<String>,
}

impl TryFrom<RawEvidenceItem> for EvidenceItem {
    type Error = String;

    fn try_from(raw: RawEvidenceItem) -> Result<Self, Self::Error> {
        let platform = Platform::parse(&raw.platform)
            .ok_or_else(|| format!("unknown platform {:?}", raw.platform))?;
        let source_id = raw
            .source_id
            .ok_or_else(|| "evidence item without source_id".to_string())?;
        let mut metrics = PlatformMetrics::from_value(platform, raw.metrics)
            .map_err(|e| format!("metrics for {source_id}: {e}"))?;
        // Trend rows carry their region next to the metrics rather than inside.
        if metrics.country().is_none() && raw.country.is_some() {
            metrics.set_country(raw.country);
        }
        Ok(EvidenceItem {
            platform,
            source_id,
            source_url: raw.source_url,
            title: raw.title,
            keyword: raw.keyword,
            metrics,
            scrape_ts: raw.scrape_ts.as_deref().and_then(parse_timestamp),
        })
    }
}

/// Normalized [0,1] volume/engagement/trend plus the (0,1] decay multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreComponents {
    #[serde(rename = "V")]
    pub volume: f64,
    #[serde(rename = "E")]
    pub engagement: f64,
    #[serde(rename = "T")]
    pub trend: f64,
    #[serde(rename = "decay_multiplier", alias = "D")]
    pub decay: f64,
}

impl Default for ScoreComponents {
    fn default() -> Self {
        Self {
            volume: 0.0,
            engagement: 0.0,
            trend: 0.0,
            decay: 1.0,
        }
    }
}

/// Representative metrics merged with group totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopularityMetrics {
    #[serde(default)]
    pub views: i64,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub comments: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub like_to_view_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment_to_view_ratio: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalWorkflow {
    pub id: String,
    pub workflow: String,
    pub platform: String,
    pub source_id: String,
    pub source_url: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub country: Option<String>,
    pub popularity_metrics: PopularityMetrics,
    pub popularity_score: f64,
    pub score_components: ScoreComponents,
    pub evidence_count: i64,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<EvidenceItem>,
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowFilters {
    pub platform: Option<String>,
    pub country: Option<String>,
    pub text: Option<String>,
}

impl WorkflowFilters {
    pub fn matches(&self, record: &CanonicalWorkflow) -> bool {
        if let Some(p) = &self.platform {
            if &record.platform != p {
                return false;
            }
        }
        if let Some(c) = &self.country {
            if record.country.as_ref() != Some(c) {
                return false;
            }
        }
        if let Some(q) = &self.text {
            let needle = q.to_lowercase();
            if !record.workflow.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn platform_accepts_source_names_and_aliases() {
        assert_eq!(Platform::parse("YouTube"), Some(Platform::Video));
        assert_eq!(Platform::parse("forum"), Some(Platform::Forum));
        assert_eq!(Platform::parse("Google_Trends"), Some(Platform::Trends));
        assert_eq!(
            Platform::parse("trends_synthetic"),
            Some(Platform::TrendsSynthetic)
        );
        assert_eq!(Platform::parse("myspace"), None);
    }

    #[test]
    fn decodes_lenient_counts() {
        let item: EvidenceItem = serde_json::from_value(json!({
            "platform": "YouTube",
            "source_id": "youtube:abc",
            "title": "Slack to Sheets",
            "metrics": {"views": "1,234", "likes": 10.7, "comments": "bad"},
            "scrape_ts": "2025-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(item.metrics.views(), Some(1234));
        assert_eq!(item.metrics.likes(), Some(10));
        assert_eq!(item.metrics.comments_or_replies(), None);
        assert!(item.scrape_ts.is_some());
    }

    #[test]
    fn trend_rows_take_top_level_country_and_column_series() {
        let item: EvidenceItem = serde_json::from_value(json!({
            "platform": "GoogleTrends",
            "source_id": "trends:n8n slack:IN",
            "keyword": "n8n slack",
            "country": "IN",
            "metrics": {
                "interest_over_time": {
                    "n8n slack": {"2025-01-01": 10, "2025-01-02": 30},
                    "isPartial": {"2025-01-01": false, "2025-01-02": true}
                },
                "growth_pct_30d": 0.25
            }
        }))
        .unwrap();
        assert_eq!(item.metrics.country(), Some("IN"));
        assert_eq!(item.metrics.interest_mean(), Some(20.0));
        assert_eq!(item.metrics.growth_pct_30d(), Some(0.25));
        assert_eq!(item.label(), Some("n8n slack"));
        assert!(item.scrape_ts.is_none());
    }

    #[test]
    fn rejects_items_without_identity() {
        let res: Result<EvidenceItem, _> =
            serde_json::from_value(json!({"platform": "YouTube", "title": "x"}));
        assert!(res.is_err());
    }

    #[test]
    fn serialization_round_trips_through_platform_tag() {
        let item = EvidenceItem::new(
            Platform::Forum,
            "discourse:42",
            PlatformMetrics::Forum(ForumMetrics {
                replies: Some(3),
                views: Some(100),
                ..Default::default()
            }),
        )
        .with_title(Some("Webhook retries".into()));
        let text = serde_json::to_string(&item).unwrap();
        let back: EvidenceItem = serde_json::from_str(&text).unwrap();
        assert_eq!(back.metrics, item.metrics);
        assert_eq!(back.platform, Platform::Forum);
    }

    #[test]
    fn parses_common_timestamp_shapes() {
        assert!(parse_timestamp("2025-01-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2025-01-01T10:00:00.123").is_some());
        assert!(parse_timestamp("2025-01-01").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn filters_match_platform_country_and_text() {
        let record = CanonicalWorkflow {
            id: "1".into(),
            workflow: "Slack Alerts".into(),
            platform: "YouTube".into(),
            source_id: "youtube:a".into(),
            source_url: None,
            keywords: vec![],
            country: Some("US".into()),
            popularity_metrics: PopularityMetrics::default(),
            popularity_score: 0.5,
            score_components: ScoreComponents::default(),
            evidence_count: 1,
            last_updated: Utc::now(),
            evidence: vec![],
        };
        let f = WorkflowFilters {
            platform: Some("YouTube".into()),
            country: Some("US".into()),
            text: Some("slack".into()),
        };
        assert!(f.matches(&record));
        let f = WorkflowFilters {
            country: Some("IN".into()),
            ..Default::default()
        };
        assert!(!f.matches(&record));
    }
}

//! Structural pattern search over rendered pages.
//!
//! Used when a source's JSON endpoints are missing or blocked. Everything here
//! is pure: callers fetch the HTML, these helpers pull identifiers and counts out.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::OnceLock;

use itertools::Itertools;

fn re(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).unwrap_or_else(|e| panic!("bad pattern {pattern}: {e}")))
}

/// "1.2K views" → 1200, "3,456 views" → 3456, "2M" → 2000000.
pub fn parse_magnitude(text: &str) -> Option<i64> {
    let cleaned = text
        .to_ascii_lowercase()
        .replace("views", "")
        .replace("view", "")
        .replace(',', "");
    let s = cleaned.trim();
    if s.is_empty() {
        return None;
    }
    let (number, mult) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1_000f64),
        Some('m') => (&s[..s.len() - 1], 1_000_000f64),
        Some('b') => (&s[..s.len() - 1], 1_000_000_000f64),
        _ => {
            let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
            return digits.parse::<i64>().ok();
        }
    };
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|f| (f * mult).round() as i64)
}

/// Decode the first JSON value that starts right after `marker`.
fn json_after(html: &str, marker: &str) -> Option<Value> {
    let start = html.find(marker)? + marker.len();
    let rest = html[start..].trim_start();
    serde_json::Deserializer::from_str(rest)
        .into_iter::<Value>()
        .next()?
        .ok()
}

/// The initial-data blob embedded in a video results page.
pub fn extract_initial_data(html: &str) -> Option<Value> {
    const MARKERS: [&str; 3] = [
        "var ytInitialData =",
        "window[\"ytInitialData\"] =",
        "ytInitialData =",
    ];
    MARKERS
        .iter()
        .find_map(|m| json_after(html, m))
        .or_else(|| {
            let start = html.find("{\"contents\"")?;
            json_after(&html[start..], "")
        })
        .filter(Value::is_object)
}

/// Every object stored under a `videoRenderer` key, depth first.
pub fn video_renderers(root: &Value) -> Vec<&Map<String, Value>> {
    let mut out = Vec::new();
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                for (k, v) in map.iter().rev() {
                    match (k.as_str(), v) {
                        ("videoRenderer", Value::Object(inner)) => out.push(inner),
                        _ => stack.push(v),
                    }
                }
            }
            Value::Array(items) => stack.extend(items.iter().rev()),
            _ => {}
        }
    }
    out
}

/// `{"simpleText": ".."}` or `{"runs": [{"text": ".."}, ..]}`.
pub fn renderer_text(v: &Value) -> Option<String> {
    if let Some(s) = v.get("simpleText").and_then(Value::as_str) {
        return Some(s.to_string());
    }
    let runs = v.get("runs")?.as_array()?;
    let joined: String = runs
        .iter()
        .filter_map(|r| r.get("text").and_then(Value::as_str))
        .collect();
    (!joined.is_empty()).then_some(joined)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScrapedVideo {
    pub video_id: String,
    pub title: Option<String>,
    pub views: Option<i64>,
}

pub fn videos_from_initial_data(root: &Value) -> Vec<ScrapedVideo> {
    video_renderers(root)
        .into_iter()
        .filter_map(|vr| {
            let video_id = vr.get("videoId")?.as_str()?.to_string();
            let title = vr.get("title").and_then(renderer_text);
            let views = vr
                .get("viewCountText")
                .and_then(renderer_text)
                .and_then(|t| parse_magnitude(&t));
            Some(ScrapedVideo {
                video_id,
                title,
                views,
            })
        })
        .unique_by(|v| v.video_id.clone())
        .collect()
}

/// Last resort when no blob decodes: pair each `"videoId"` with the first
/// `viewCountText` that follows it before the next id.
pub fn videos_from_text(html: &str) -> Vec<ScrapedVideo> {
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    static VIEWS_RE: OnceLock<Regex> = OnceLock::new();
    let id_re = re(&ID_RE, r#""videoId"\s*:\s*"([A-Za-z0-9_-]{6,})""#);
    let views_re = re(
        &VIEWS_RE,
        r#""viewCountText"\s*:\s*\{\s*"simpleText"\s*:\s*"([^"]+)""#,
    );

    // (match start, match end, id)
    let hits: Vec<(usize, usize, &str)> = id_re
        .captures_iter(html)
        .filter_map(|c| {
            let whole = c.get(0)?;
            Some((whole.start(), whole.end(), c.get(1)?.as_str()))
        })
        .collect();

    hits.iter()
        .enumerate()
        .map(|(i, (_, pos, id))| {
            let end = hits.get(i + 1).map(|(start, _, _)| *start).unwrap_or(html.len());
            let views = views_re
                .captures(&html[*pos..end])
                .and_then(|c| c.get(1))
                .and_then(|m| parse_magnitude(m.as_str()));
            ScrapedVideo {
                video_id: id.to_string(),
                title: None,
                views,
            }
        })
        .unique_by(|v| v.video_id.clone())
        .collect()
}

/// Topic ids linked from a forum page, first occurrence order.
pub fn topic_ids(html: &str) -> Vec<u64> {
    static TOPIC_RE: OnceLock<Regex> = OnceLock::new();
    // Optional slug segment must hold a non-digit, so `/t/123/4` reads as topic 123.
    let link = re(&TOPIC_RE, r"/t/(?:[\w-]*[^\W\d][\w-]*/)?(\d+)");
    link.captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().parse::<u64>().ok())
        .unique()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicPageStats {
    pub title: Option<String>,
    pub posts: i64,
    pub views: Option<i64>,
    pub likes: i64,
}

fn sum_counts(re: &Regex, html: &str) -> i64 {
    re.captures_iter(html)
        .filter_map(|c| c.get(1)?.as_str().replace(',', "").parse::<i64>().ok())
        .sum()
}

/// Heuristic metrics from a rendered topic page.
pub fn topic_page_stats(html: &str) -> TopicPageStats {
    static OG_TITLE: OnceLock<Regex> = OnceLock::new();
    static TITLE: OnceLock<Regex> = OnceLock::new();
    static POST_ID: OnceLock<Regex> = OnceLock::new();
    static ARTICLE: OnceLock<Regex> = OnceLock::new();
    static VIEWS_TEXT: OnceLock<Regex> = OnceLock::new();
    static VIEWS_JSON: OnceLock<Regex> = OnceLock::new();
    static LIKE_COUNT: OnceLock<Regex> = OnceLock::new();
    static LIKE_ARIA: OnceLock<Regex> = OnceLock::new();

    let title = re(&OG_TITLE, r#"<meta property="og:title" content="([^"]+)""#)
        .captures(html)
        .or_else(|| re(&TITLE, r"<title>([^<]+)</title>").captures(html))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|t| !t.is_empty());

    let mut posts = re(&POST_ID, r#"data-post-id="\d+""#).find_iter(html).count();
    if posts == 0 {
        posts = re(&ARTICLE, r"<article").find_iter(html).count();
    }

    let views = re(&VIEWS_TEXT, r"(?i)([0-9][0-9,]*)\s+views")
        .captures(html)
        .or_else(|| re(&VIEWS_JSON, r#""views":\s*(\d+)"#).captures(html))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().replace(',', "").parse::<i64>().ok());

    let mut likes = sum_counts(re(&LIKE_COUNT, r#"like-count">?\s*([0-9][0-9,]*)"#), html);
    if likes == 0 {
        likes = sum_counts(re(&LIKE_ARIA, r#"(?i)aria-label="([0-9][0-9,]*) likes?""#), html);
    }

    TopicPageStats {
        title,
        posts: posts as i64,
        views,
        likes,
    }
}

//! Typed configuration for the collectors, scoring and storage.
//!
//! Every struct has `Default` values that match the documented pipeline
//! defaults; `from_env()` overlays whatever the environment provides.

use crate::util::env::{env_first, env_list, env_opt, env_parse, env_parse_opt, log_snapshot};
use std::path::PathBuf;
use std::time::Duration;

/// Page and batch sizes above this are rejected by the video search API.
pub const VIDEO_API_MAX_PAGE: usize = 50;

pub const DEFAULT_USER_AGENT: &str = "workflow-pulse-collector/0.1 (+https://github.com)";
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub user_agent: String,
    pub proxy: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            proxy: None,
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            timeout: Duration::from_secs(env_parse("FETCH_TIMEOUT_SECS", d.timeout.as_secs())),
            max_retries: env_parse("FETCH_MAX_RETRIES", d.max_retries),
            backoff_base: Duration::from_millis(env_parse(
                "FETCH_BACKOFF_MS",
                d.backoff_base.as_millis() as u64,
            )),
            backoff_cap: Duration::from_millis(env_parse(
                "FETCH_BACKOFF_CAP_MS",
                d.backoff_cap.as_millis() as u64,
            )),
            user_agent: env_opt("COLLECTOR_USER_AGENT").unwrap_or(d.user_agent),
            proxy: env_first(&["COLLECTOR_PROXY", "HTTPS_PROXY", "HTTP_PROXY"]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoConfig {
    pub api_base: String,
    pub web_base: String,
    /// Single key and pool are merged; the single key goes first.
    pub api_keys: Vec<String>,
    pub region: String,
    pub max_pages: usize,
    pub page_size: usize,
    pub batch_size: usize,
    pub page_delay: Duration,
    pub concurrency: usize,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            api_base: "https://www.googleapis.com/youtube/v3".to_string(),
            web_base: "https://www.youtube.com".to_string(),
            api_keys: Vec::new(),
            region: "US".to_string(),
            max_pages: 2,
            page_size: VIDEO_API_MAX_PAGE,
            batch_size: VIDEO_API_MAX_PAGE,
            page_delay: Duration::from_millis(500),
            concurrency: 4,
        }
    }
}

impl VideoConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let mut api_keys = env_list("YOUTUBE_API_KEYS");
        if let Some(single) = env_opt("YOUTUBE_API_KEY") {
            if !api_keys.contains(&single) {
                api_keys.insert(0, single);
            }
        }
        Self {
            api_base: env_opt("YOUTUBE_API_BASE").unwrap_or(d.api_base),
            web_base: env_opt("YOUTUBE_WEB_BASE").unwrap_or(d.web_base),
            api_keys,
            region: env_opt("YOUTUBE_REGION").unwrap_or(d.region),
            max_pages: env_parse("YOUTUBE_MAX_PAGES", d.max_pages).max(1),
            page_size: env_parse("YOUTUBE_PAGE_SIZE", d.page_size).clamp(1, VIDEO_API_MAX_PAGE),
            batch_size: d.batch_size,
            page_delay: Duration::from_millis(env_parse("YOUTUBE_PAGE_DELAY_MS", 500u64)),
            concurrency: env_parse("YOUTUBE_CONCURRENCY", d.concurrency).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ForumConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_user: Option<String>,
    pub max_pages: usize,
    pub country_cache_cap: usize,
    pub concurrency: usize,
    pub html_retries: u32,
}

impl Default for ForumConfig {
    fn default() -> Self {
        Self {
            base_url: "https://community.n8n.io".to_string(),
            api_key: None,
            api_user: None,
            max_pages: 2,
            country_cache_cap: 4096,
            concurrency: 4,
            html_retries: 3,
        }
    }
}

impl ForumConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_opt("DISCOURSE_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.base_url),
            api_key: env_opt("DISCOURSE_API_KEY"),
            api_user: env_opt("DISCOURSE_API_USER"),
            max_pages: env_parse("DISCOURSE_MAX_PAGES", d.max_pages).max(1),
            country_cache_cap: env_parse("DISCOURSE_COUNTRY_CACHE_CAP", d.country_cache_cap).max(1),
            concurrency: env_parse("DISCOURSE_CONCURRENCY", d.concurrency).max(1),
            html_retries: d.html_retries,
        }
    }
}

/// Reference keyword with a known absolute monthly volume.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendsAnchor {
    pub keyword: String,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct TrendsConfig {
    pub api_base: String,
    pub hl: String,
    pub tz: i32,
    pub timeframe: String,
    pub geos: Vec<String>,
    pub attempts: u32,
    pub rate_limit_backoff: Duration,
    pub pacing: (Duration, Duration),
    pub user_agent: String,
    pub anchor: Option<TrendsAnchor>,
    pub concurrency: usize,
}

impl Default for TrendsConfig {
    fn default() -> Self {
        Self {
            api_base: "https://trends.google.com/trends/api".to_string(),
            hl: "en-US".to_string(),
            tz: 360,
            timeframe: "today 3-m".to_string(),
            geos: vec!["US".to_string()],
            attempts: 4,
            rate_limit_backoff: Duration::from_secs(5),
            pacing: (Duration::from_millis(500), Duration::from_millis(2000)),
            user_agent: BROWSER_USER_AGENT.to_string(),
            anchor: None,
            concurrency: 1,
        }
    }
}

impl TrendsConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let geos = env_list("TRENDS_GEOS");
        let anchor = match (
            env_opt("TRENDS_ANCHOR_KEYWORD"),
            env_parse_opt::<f64>("TRENDS_ANCHOR_VOLUME"),
        ) {
            (Some(keyword), Some(volume)) if volume > 0.0 => Some(TrendsAnchor { keyword, volume }),
            _ => None,
        };
        Self {
            api_base: env_opt("TRENDS_API_BASE").unwrap_or(d.api_base),
            timeframe: env_opt("TRENDS_TIMEFRAME").unwrap_or(d.timeframe),
            geos: if geos.is_empty() { d.geos } else { geos },
            user_agent: env_opt("TRENDS_USER_AGENT").unwrap_or(d.user_agent),
            anchor,
            ..d
        }
    }
}

/// Weights and constants of the popularity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub weight_volume: f64,
    pub weight_engagement: f64,
    pub weight_trend: f64,
    pub half_life_days: f64,
    /// `log1p(views)` is divided by this before clamping.
    pub volume_scale: f64,
    /// Raw engagement ratios are multiplied by this before clamping.
    pub engagement_scale: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weight_volume: 0.5,
            weight_engagement: 0.3,
            weight_trend: 0.2,
            half_life_days: 30.0,
            volume_scale: 10.0,
            engagement_scale: 10.0,
        }
    }
}

impl ScoringConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let half_life = env_parse("SCORE_HALF_LIFE_DAYS", d.half_life_days);
        Self {
            weight_volume: env_parse("SCORE_WEIGHT_V", d.weight_volume),
            weight_engagement: env_parse("SCORE_WEIGHT_E", d.weight_engagement),
            weight_trend: env_parse("SCORE_WEIGHT_T", d.weight_trend),
            half_life_days: if half_life > 0.0 { half_life } else { d.half_life_days },
            ..d
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub raw_path: PathBuf,
    pub snapshot_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            raw_path: PathBuf::from("data/workflows.json"),
            snapshot_path: PathBuf::from("data/canonical_workflows.json"),
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            database_url: env_opt("DATABASE_URL"),
            max_connections: env_parse("DB_MAX_CONNS", d.max_connections).max(1),
            raw_path: env_opt("RAW_EVIDENCE_PATH").map(PathBuf::from).unwrap_or(d.raw_path),
            snapshot_path: env_opt("CANONICAL_SNAPSHOT_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.snapshot_path),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub fetch: FetchConfig,
    pub video: VideoConfig,
    pub forum: ForumConfig,
    pub trends: TrendsConfig,
    pub scoring: ScoringConfig,
    pub storage: StorageConfig,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        log_snapshot(
            "pipeline",
            &[
                "COLLECTOR_PROXY",
                "COLLECTOR_USER_AGENT",
                "YOUTUBE_API_KEY",
                "YOUTUBE_API_KEYS",
                "DISCOURSE_BASE_URL",
                "DISCOURSE_API_KEY",
                "TRENDS_GEOS",
                "TRENDS_ANCHOR_KEYWORD",
                "TRENDS_ANCHOR_VOLUME",
                "SCORE_HALF_LIFE_DAYS",
                "DATABASE_URL",
                "RAW_EVIDENCE_PATH",
                "CANONICAL_SNAPSHOT_PATH",
            ],
        );
        Self {
            fetch: FetchConfig::from_env(),
            video: VideoConfig::from_env(),
            forum: ForumConfig::from_env(),
            trends: TrendsConfig::from_env(),
            scoring: ScoringConfig::from_env(),
            storage: StorageConfig::from_env(),
        }
    }
}

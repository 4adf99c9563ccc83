//! Popularity scoring: per-item V/E/T/D components and the per-group score.
//!
//! The engine carries its own `now` so that a whole ingest run decays every
//! item against the same instant, and tests can freeze the clock.

use chrono::{DateTime, Utc};

use crate::config::ScoringConfig;
use crate::models::{parse_timestamp, EvidenceItem, Platform, ScoreComponents};

/// Clamp into [0,1]; NaN maps to 0.
pub fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        return 0.0;
    }
    x.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupScore {
    pub popularity_score: f64,
    pub components: ScoreComponents,
}

#[derive(Debug, Clone)]
pub struct ScoringEngine {
    cfg: ScoringConfig,
    now: DateTime<Utc>,
}

impl ScoringEngine {
    pub fn new(cfg: ScoringConfig, now: DateTime<Utc>) -> Self {
        Self { cfg, now }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// `exp(-ln2 * age / half_life)`, capped at 1 so future timestamps do not boost.
    pub fn decay_multiplier(&self, published: Option<DateTime<Utc>>) -> f64 {
        let Some(ts) = published else {
            return 1.0;
        };
        let age_days = (self.now - ts).num_milliseconds() as f64 / 86_400_000.0;
        let d = (-std::f64::consts::LN_2 * age_days / self.cfg.half_life_days).exp();
        if d.is_finite() {
            d.min(1.0)
        } else {
            1.0
        }
    }

    pub fn item_components(&self, item: &EvidenceItem) -> ScoreComponents {
        let metrics = &item.metrics;
        let views = match item.platform {
            // Interest index stands in for views on trend rows.
            Platform::Trends | Platform::TrendsSynthetic => metrics.interest_mean().unwrap_or(0.0),
            Platform::Video | Platform::Forum => metrics.views().unwrap_or(0) as f64,
        }
        .max(0.0);

        let volume = clamp01(views.ln_1p() / self.cfg.volume_scale);

        let engagement = if views > 0.0 {
            let likes = metrics.likes().unwrap_or(0).max(0) as f64;
            let comments = metrics.comments_or_replies().unwrap_or(0).max(0) as f64;
            let raw = 0.6 * (likes / views) + 0.4 * (comments / views);
            clamp01(raw * self.cfg.engagement_scale)
        } else {
            0.0
        };

        let growth = metrics.growth_pct_30d().unwrap_or(0.0);
        let trend = clamp01((growth.tanh() + 1.0) / 2.0);

        let published = metrics.recency_ts().and_then(parse_timestamp);
        let decay = self.decay_multiplier(published);

        ScoreComponents {
            volume,
            engagement,
            trend,
            decay,
        }
    }

    /// Mean of each component over the group (V/E/T default 0, D defaults 1),
    /// then `clamp01((wV·V + wE·E + wT·T) · D)`.
    pub fn aggregate(&self, items: &[EvidenceItem]) -> GroupScore {
        if items.is_empty() {
            return GroupScore {
                popularity_score: 0.0,
                components: ScoreComponents::default(),
            };
        }
        let n = items.len() as f64;
        let sum = items
            .iter()
            .map(|it| self.item_components(it))
            .fold((0.0, 0.0, 0.0, 0.0), |acc, c| {
                (
                    acc.0 + c.volume,
                    acc.1 + c.engagement,
                    acc.2 + c.trend,
                    acc.3 + c.decay,
                )
            });
        let components = ScoreComponents {
            volume: sum.0 / n,
            engagement: sum.1 / n,
            trend: sum.2 / n,
            decay: sum.3 / n,
        };
        let raw = self.cfg.weight_volume * components.volume
            + self.cfg.weight_engagement * components.engagement
            + self.cfg.weight_trend * components.trend;
        GroupScore {
            popularity_score: clamp01(raw * components.decay),
            components,
        }
    }
}

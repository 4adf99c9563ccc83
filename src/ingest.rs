//! Raw evidence → canonical workflow records → storage.

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use itertools::Itertools;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::models::{CanonicalWorkflow, EvidenceItem, PopularityMetrics};
use crate::normalization::{group_evidence, key_name, EvidenceGroups};
use crate::scoring::ScoringEngine;
use crate::storage::{SnapshotStore, WorkflowStore};

/// Keys the group totals own; the representative's copies are dropped.
const TOTAL_KEYS: [&str; 5] = [
    "views",
    "likes",
    "comments",
    "like_to_view_ratio",
    "comment_to_view_ratio",
];

/// Decoded raw evidence file.
#[derive(Debug, Default)]
pub struct RawEvidence {
    pub items: Vec<EvidenceItem>,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Destination {
    Storage,
    Snapshot(PathBuf),
    /// Nothing to ingest.
    Skipped,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    pub evidence: usize,
    pub skipped: usize,
    pub canonical: usize,
    pub destination: Destination,
}

impl Default for IngestReport {
    fn default() -> Self {
        Self {
            evidence: 0,
            skipped: 0,
            canonical: 0,
            destination: Destination::Skipped,
        }
    }
}

/// Read a JSON array of evidence items, skipping the ones that don't decode.
/// `Ok(None)` when the file does not exist.
pub async fn load_raw(path: &Path) -> Result<Option<RawEvidence>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let value: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    let Value::Array(rows) = value else {
        bail!("{} is not a JSON array", path.display());
    };

    let mut raw = RawEvidence::default();
    for (idx, row) in rows.into_iter().enumerate() {
        match serde_json::from_value::<EvidenceItem>(row) {
            Ok(item) => raw.items.push(item),
            Err(e) => {
                warn!(index = idx, error = %e, "skipping malformed evidence item");
                raw.skipped += 1;
            }
        }
    }
    Ok(Some(raw))
}

/// Most frequent value; ties go to whichever was seen first.
fn most_common<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut counts: IndexMap<&str, usize> = IndexMap::new();
    for v in values {
        *counts.entry(v).or_default() += 1;
    }
    counts
        .into_iter()
        .fold(None, |best, (v, n)| match best {
            Some((_, m)) if m >= n => best,
            _ => Some((v, n)),
        })
        .map(|(v, _)| v)
}

/// One canonical record for a group. `None` for an empty group.
pub fn build_canonical(
    key: &str,
    evidence: Vec<EvidenceItem>,
    engine: &ScoringEngine,
) -> Option<CanonicalWorkflow> {
    let rep = evidence.first()?;

    let workflow = most_common(evidence.iter().filter_map(|e| e.label()))
        .unwrap_or_else(|| key_name(key))
        .to_string();
    let platform = most_common(evidence.iter().map(|e| e.platform.as_str()))
        .unwrap_or("mixed")
        .to_string();
    let country = most_common(evidence.iter().filter_map(|e| e.metrics.country()))
        .map(str::to_string);

    let (views, likes, comments) = evidence.iter().fold((0i64, 0i64, 0i64), |acc, e| {
        (
            acc.0.saturating_add(e.metrics.views().unwrap_or(0).max(0)),
            acc.1.saturating_add(e.metrics.likes().unwrap_or(0).max(0)),
            acc.2.saturating_add(e.metrics.comments_or_replies().unwrap_or(0).max(0)),
        )
    });
    let (like_to_view_ratio, comment_to_view_ratio) = if views > 0 {
        (
            Some(likes as f64 / views as f64),
            Some(comments as f64 / views as f64),
        )
    } else {
        (None, None)
    };

    let mut extra = rep.metrics.to_map();
    for k in TOTAL_KEYS {
        extra.remove(k);
    }
    extra.retain(|_, v| !v.is_null());

    let keywords = evidence
        .iter()
        .filter_map(|e| e.keyword.clone())
        .unique()
        .collect();
    let score = engine.aggregate(&evidence);

    Some(CanonicalWorkflow {
        id: Uuid::new_v4().to_string(),
        workflow,
        platform,
        source_id: rep.source_id.clone(),
        source_url: rep.source_url.clone(),
        keywords,
        country,
        popularity_metrics: PopularityMetrics {
            views,
            likes,
            comments,
            like_to_view_ratio,
            comment_to_view_ratio,
            extra,
        },
        popularity_score: score.popularity_score,
        score_components: score.components,
        evidence_count: evidence.len() as i64,
        last_updated: engine.now(),
        evidence,
    })
}

pub fn canonicalize(groups: EvidenceGroups, engine: &ScoringEngine) -> Vec<CanonicalWorkflow> {
    groups
        .into_iter()
        .filter_map(|(key, evidence)| build_canonical(&key, evidence, engine))
        .collect()
}

/// Storage first; the snapshot only when storage is absent or fails.
pub async fn persist(
    records: &[CanonicalWorkflow],
    store: Option<&dyn WorkflowStore>,
    snapshot: Option<&SnapshotStore>,
) -> Result<Destination> {
    let mut store_error = None;
    if let Some(store) = store {
        match store.save(records).await {
            Ok(n) => {
                info!(count = n, "canonical workflows stored");
                return Ok(Destination::Storage);
            }
            Err(e) => {
                warn!("storage write failed: {e:#}");
                store_error = Some(e);
            }
        }
    }

    let Some(snapshot) = snapshot else {
        return Err(store_error
            .unwrap_or_else(|| anyhow::anyhow!("no storage configured"))
            .context("snapshot fallback disabled"));
    };
    snapshot.write_all(records).await.map_err(|e| match store_error {
        Some(db) => e.context(format!("storage also failed: {db:#}")),
        None => e,
    })?;
    Ok(Destination::Snapshot(snapshot.path().to_path_buf()))
}

/// Full re-read of raw evidence; every record is recomputed from scratch.
#[instrument(skip_all, fields(raw = %raw_path.display()))]
pub async fn run_ingest(
    raw_path: &Path,
    engine: &ScoringEngine,
    store: Option<&dyn WorkflowStore>,
    snapshot: Option<&SnapshotStore>,
) -> Result<IngestReport> {
    let Some(raw) = load_raw(raw_path).await? else {
        warn!("no raw evidence found");
        return Ok(IngestReport::default());
    };
    let evidence = raw.items.len();
    let groups = group_evidence(raw.items);
    let canonical = canonicalize(groups, engine);
    info!(evidence, skipped = raw.skipped, groups = canonical.len(), "evidence grouped");

    let destination = persist(&canonical, store, snapshot).await?;
    Ok(IngestReport {
        evidence,
        skipped: raw.skipped,
        canonical: canonical.len(),
        destination,
    })
}

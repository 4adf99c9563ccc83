//! Collection run: query terms → every selected collector → raw evidence file.

use anyhow::{Context, Result};
use futures::future::join_all;
use itertools::Itertools;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use crate::collectors::{EvidenceCollector, ForumCollector, TrendsCollector, VideoCollector};
use crate::config::PipelineConfig;
use crate::fetch::{CredentialPool, FetchClient};
use crate::ingest::load_raw;
use crate::models::EvidenceItem;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, clap::ValueEnum)]
pub enum Source {
    #[value(name = "youtube", alias = "video")]
    Video,
    #[value(name = "discourse", alias = "forum")]
    Forum,
    #[value(name = "trends", alias = "google_trends")]
    Trends,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::Video, Source::Forum, Source::Trends];

    pub fn label(self) -> &'static str {
        match self {
            Source::Video => "youtube",
            Source::Forum => "discourse",
            Source::Trends => "trends",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectPlan {
    pub queries: Vec<String>,
    pub sources: Vec<Source>,
    /// Pages of recent forum activity to add, when the forum is selected.
    pub recent_pages: Option<usize>,
}

async fn run_source(
    source: Source,
    client: &FetchClient,
    cfg: &PipelineConfig,
    plan: &CollectPlan,
) -> Vec<EvidenceItem> {
    let items = match source {
        Source::Video => {
            let keys = Arc::new(CredentialPool::new(cfg.video.api_keys.clone()));
            VideoCollector::new(client.clone(), cfg.video.clone(), keys)
                .collect_all(&plan.queries)
                .await
        }
        Source::Forum => {
            let forum = ForumCollector::new(client.clone(), cfg.forum.clone());
            let mut items = forum.collect_all(&plan.queries).await;
            if let Some(pages) = plan.recent_pages {
                items.extend(forum.collect_recent(pages).await);
            }
            items
        }
        Source::Trends => {
            TrendsCollector::new(client.clone(), cfg.trends.clone())
                .collect_all(&plan.queries)
                .await
        }
    };
    info!(source = source.label(), count = items.len(), "source finished");
    items
}

/// Runs the selected sources side by side. First occurrence of a
/// `source_id` wins, in source order.
#[instrument(skip_all, fields(queries = plan.queries.len()))]
pub async fn collect_evidence(
    client: &FetchClient,
    cfg: &PipelineConfig,
    plan: &CollectPlan,
) -> Vec<EvidenceItem> {
    let sources: Vec<Source> = plan.sources.iter().copied().unique().collect();
    if plan.queries.is_empty() && plan.recent_pages.is_none() {
        warn!("no query terms given");
    }
    let batches = join_all(
        sources
            .iter()
            .map(|&s| run_source(s, client, cfg, plan)),
    )
    .await;
    batches
        .into_iter()
        .flatten()
        .unique_by(|item| item.source_id.clone())
        .collect()
}

/// New items first; earlier items whose `source_id` was not re-collected are kept.
pub async fn merge_with_existing(path: &Path, fresh: Vec<EvidenceItem>) -> Result<Vec<EvidenceItem>> {
    let existing = load_raw(path).await?.map(|raw| raw.items).unwrap_or_default();
    Ok(fresh
        .into_iter()
        .chain(existing)
        .unique_by(|item| item.source_id.clone())
        .collect())
}

pub async fn write_raw(path: &Path, items: &[EvidenceItem]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
    }
    let body = serde_json::to_vec_pretty(items).context("encoding raw evidence")?;
    tokio::fs::write(path, body)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    info!(path = %path.display(), count = items.len(), "raw evidence written");
    Ok(())
}

/// Collect and persist. Returns how many items landed in the file.
pub async fn run_collect(cfg: &PipelineConfig, plan: &CollectPlan, merge: bool) -> Result<usize> {
    let client = FetchClient::from_config(&cfg.fetch)?;
    let fresh = collect_evidence(&client, cfg, plan).await;
    let path = &cfg.storage.raw_path;
    let items = if merge {
        merge_with_existing(path, fresh).await?
    } else {
        fresh
    };
    write_raw(path, &items).await?;
    Ok(items.len())
}

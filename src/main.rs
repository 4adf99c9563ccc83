use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{ArgAction, Args, Parser, Subcommand};
use itertools::Itertools;
use tracing::{info, warn};

use workflow_pulse::collect::{run_collect, CollectPlan, Source};
use workflow_pulse::config::PipelineConfig;
use workflow_pulse::ingest::{run_ingest, Destination};
use workflow_pulse::logging::init_logging;
use workflow_pulse::models::WorkflowFilters;
use workflow_pulse::scoring::ScoringEngine;
use workflow_pulse::storage::{PgStore, SnapshotStore, WorkflowPage, WorkflowStore};

#[derive(Parser, Debug)]
#[command(name = "workflow-pulse", version, about = "Workflow popularity collection and scoring")]
struct Cli {
    /// More log output (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run collectors for query terms and write the raw evidence file
    Collect(CollectArgs),
    /// Group, score and store the raw evidence
    Ingest(IngestArgs),
    /// Read canonical workflows, highest score first
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct CollectArgs {
    /// Query terms
    queries: Vec<String>,
    /// File with one query term per line (blank lines and `#` comments ignored)
    #[arg(long)]
    queries_file: Option<PathBuf>,
    /// Restrict to these sources (comma-separated)
    #[arg(long, value_enum, value_delimiter = ',')]
    only: Vec<Source>,
    /// Skip these sources (comma-separated)
    #[arg(long, value_enum, value_delimiter = ',')]
    skip: Vec<Source>,
    /// Also collect recent forum topics (optionally how many pages)
    #[arg(long, num_args = 0..=1, default_missing_value = "1")]
    recent: Option<usize>,
    /// Keep previously collected items that were not re-collected
    #[arg(long, action = ArgAction::SetTrue)]
    merge: bool,
}

#[derive(Debug, Args)]
struct IngestArgs {
    /// Fail instead of writing the snapshot file when storage is unavailable
    #[arg(long = "no-fallback", action = ArgAction::SetTrue)]
    no_fallback: bool,
    /// Skip the database and write the snapshot file only
    #[arg(long = "snapshot-only", action = ArgAction::SetTrue)]
    snapshot_only: bool,
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(long)]
    platform: Option<String>,
    #[arg(long)]
    country: Option<String>,
    /// Case-insensitive substring of the workflow name
    #[arg(long, short = 'q')]
    text: Option<String>,
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(i64).range(1..=100))]
    limit: i64,
    /// 1-based page number
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(i64).range(1..))]
    page: i64,
}

fn select_sources(only: &[Source], skip: &[Source]) -> Vec<Source> {
    Source::ALL
        .into_iter()
        .filter(|s| only.is_empty() || only.contains(s))
        .filter(|s| !skip.contains(s))
        .collect()
}

fn read_queries(args: &CollectArgs) -> Result<Vec<String>> {
    let mut queries: Vec<String> = args
        .queries
        .iter()
        .map(|q| q.trim().to_string())
        .filter(|q| !q.is_empty())
        .collect();
    if let Some(path) = &args.queries_file {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        queries.extend(
            body.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    Ok(queries.into_iter().unique().collect())
}

/// Rows to skip for a 1-based page.
fn page_offset(page: i64, limit: i64) -> i64 {
    (page - 1).saturating_mul(limit)
}

async fn connect_store(cfg: &PipelineConfig) -> Option<PgStore> {
    let url = cfg.storage.database_url.as_deref()?;
    match PgStore::connect(url, cfg.storage.max_connections).await {
        Ok(store) => Some(store),
        Err(e) => {
            warn!("database unavailable: {e:#}");
            None
        }
    }
}

async fn collect(cfg: &PipelineConfig, args: CollectArgs) -> Result<()> {
    let queries = read_queries(&args)?;
    let sources = select_sources(&args.only, &args.skip);
    if sources.is_empty() {
        info!("no sources selected; nothing to do");
        return Ok(());
    }
    if queries.is_empty() && args.recent.is_none() {
        bail!("give at least one query term, --queries-file, or --recent");
    }
    let plan = CollectPlan {
        queries,
        sources,
        recent_pages: args.recent,
    };
    let count = run_collect(cfg, &plan, args.merge).await?;
    info!(count, path = %cfg.storage.raw_path.display(), "collection complete");
    Ok(())
}

async fn ingest(cfg: &PipelineConfig, args: IngestArgs) -> Result<()> {
    let engine = ScoringEngine::new(cfg.scoring.clone(), Utc::now());
    let store = if args.snapshot_only {
        None
    } else {
        connect_store(cfg).await
    };
    let snapshot = SnapshotStore::new(&cfg.storage.snapshot_path);
    let snapshot = (!args.no_fallback || args.snapshot_only).then_some(&snapshot);

    let report = run_ingest(
        &cfg.storage.raw_path,
        &engine,
        store.as_ref().map(|s| s as &dyn WorkflowStore),
        snapshot,
    )
    .await?;
    match &report.destination {
        Destination::Storage => info!(count = report.canonical, "ingest stored in database"),
        Destination::Snapshot(path) => {
            info!(count = report.canonical, path = %path.display(), "ingest written to snapshot")
        }
        Destination::Skipped => info!("nothing to ingest"),
    }
    if report.skipped > 0 {
        warn!(skipped = report.skipped, "some evidence items were malformed");
    }
    Ok(())
}

async fn query(cfg: &PipelineConfig, args: QueryArgs) -> Result<()> {
    let filters = WorkflowFilters {
        platform: args.platform,
        country: args.country,
        text: args.text,
    };
    let offset = page_offset(args.page, args.limit);

    let mut page: Option<WorkflowPage> = None;
    if let Some(store) = connect_store(cfg).await {
        match store.query_workflows(&filters, args.limit, offset).await {
            Ok(p) => page = Some(p),
            Err(e) => warn!("database query failed, using snapshot: {e:#}"),
        }
    }
    let page = match page {
        Some(p) => p,
        None => {
            SnapshotStore::new(&cfg.storage.snapshot_path)
                .query_workflows(&filters, args.limit, offset)
                .await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&page)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;
    let cfg = PipelineConfig::from_env();

    match cli.command {
        Command::Collect(args) => collect(&cfg, args).await,
        Command::Ingest(args) => ingest(&cfg, args).await,
        Command::Query(args) => query(&cfg, args).await,
    }
}

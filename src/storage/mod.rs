//! Canonical workflow persistence.
//!
//! `WorkflowStore` is the seam ingest writes through and the CLI reads
//! through. Postgres is the primary backend; the JSON snapshot doubles as the
//! write fallback and the read fallback.

pub mod file;
pub mod postgres;

pub use file::SnapshotStore;
pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{CanonicalWorkflow, WorkflowFilters};

/// One page of query results plus the unpaged match count.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowPage {
    pub records: Vec<CanonicalWorkflow>,
    pub total: i64,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Insert or overwrite by `source_id`. An existing row keeps its `id`.
    async fn upsert(&self, record: &CanonicalWorkflow) -> Result<()>;

    /// Filtered, highest score first.
    async fn query_workflows(
        &self,
        filters: &WorkflowFilters,
        limit: i64,
        offset: i64,
    ) -> Result<WorkflowPage>;

    /// Upsert a whole ingest run. Stops at the first failure.
    async fn save(&self, records: &[CanonicalWorkflow]) -> Result<usize> {
        for record in records {
            self.upsert(record).await?;
        }
        Ok(records.len())
    }
}

/// Query semantics shared by the in-process stores.
pub fn page_in_memory(
    records: Vec<CanonicalWorkflow>,
    filters: &WorkflowFilters,
    limit: i64,
    offset: i64,
) -> WorkflowPage {
    let mut matched: Vec<CanonicalWorkflow> =
        records.into_iter().filter(|r| filters.matches(r)).collect();
    // Stable sort: equal scores keep file order.
    matched.sort_by(|a, b| b.popularity_score.total_cmp(&a.popularity_score));

    let total = matched.len() as i64;
    let records = matched
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect();
    WorkflowPage { records, total }
}

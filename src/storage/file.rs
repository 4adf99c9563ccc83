use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{page_in_memory, WorkflowPage, WorkflowStore};
use crate::models::{CanonicalWorkflow, WorkflowFilters};

/// Canonical records as one JSON array on disk.
///
/// Ingest overwrites it wholesale with `write_all`; `upsert` exists so the
/// snapshot can stand in for the database behind the same trait.
#[derive(Debug)]
pub struct SnapshotStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file reads as empty.
    pub async fn load(&self) -> Result<Vec<CanonicalWorkflow>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.path.display(), "snapshot not found");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", self.path.display()));
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("decoding snapshot {}", self.path.display()))
    }

    /// Replace the whole file. Written to a sibling temp file first, then renamed.
    pub async fn write_all(&self, records: &[CanonicalWorkflow]) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.write_unlocked(records).await
    }

    async fn write_unlocked(&self, records: &[CanonicalWorkflow]) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let body = serde_json::to_vec(records).context("encoding snapshot")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        info!(path = %self.path.display(), count = records.len(), "snapshot written");
        Ok(())
    }
}

#[async_trait]
impl WorkflowStore for SnapshotStore {
    async fn upsert(&self, record: &CanonicalWorkflow) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.load().await?;
        match records.iter_mut().find(|r| r.source_id == record.source_id) {
            Some(existing) => {
                let id = std::mem::take(&mut existing.id);
                *existing = record.clone();
                existing.id = id;
            }
            None => records.push(record.clone()),
        }
        self.write_unlocked(&records).await
    }

    async fn query_workflows(
        &self,
        filters: &WorkflowFilters,
        limit: i64,
        offset: i64,
    ) -> Result<WorkflowPage> {
        let records = self.load().await?;
        Ok(page_in_memory(records, filters, limit, offset))
    }

    async fn save(&self, records: &[CanonicalWorkflow]) -> Result<usize> {
        self.write_all(records).await?;
        Ok(records.len())
    }
}

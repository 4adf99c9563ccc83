use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode},
    types::Json,
    PgPool, Postgres, QueryBuilder, Row,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{WorkflowPage, WorkflowStore};
use crate::models::{CanonicalWorkflow, PopularityMetrics, ScoreComponents, WorkflowFilters};
use crate::util::env::env_flag;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflows (
    id                 TEXT PRIMARY KEY,
    workflow           TEXT NOT NULL,
    platform           TEXT NOT NULL,
    source_id          TEXT NOT NULL UNIQUE,
    source_url         TEXT,
    keywords           JSONB NOT NULL DEFAULT '[]'::jsonb,
    country            TEXT,
    popularity_metrics JSONB NOT NULL DEFAULT '{}'::jsonb,
    popularity_score   DOUBLE PRECISION NOT NULL DEFAULT 0,
    score_components   JSONB NOT NULL DEFAULT '{}'::jsonb,
    evidence_count     BIGINT NOT NULL DEFAULT 0,
    last_updated       TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS workflows_platform_idx ON workflows (platform);
CREATE INDEX IF NOT EXISTS workflows_country_idx ON workflows (country);
CREATE INDEX IF NOT EXISTS workflows_score_idx ON workflows (popularity_score DESC);
"#;

const COLUMNS: &str = "id, workflow, platform, source_id, source_url, keywords, country, \
     popularity_metrics, popularity_score, score_components, evidence_count, last_updated";

#[derive(Clone)]
pub struct PgStore {
    pub pool: PgPool,
}

impl PgStore {
    // The DSN may carry credentials; keep it out of spans.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let mut connect_options =
            PgConnectOptions::from_str(database_url).context("parsing DATABASE_URL")?;
        if database_url.contains("sslmode=require") {
            connect_options = connect_options.ssl_mode(PgSslMode::Require);
        }
        if !env_flag("USE_PREPARED", false) {
            // PgBouncer transaction mode
            connect_options = connect_options.statement_cache_capacity(0);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(connect_options)
            .await
            .context("connecting to postgres")?;
        info!("connected to db");

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Idempotent; safe to run on every start.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("creating workflows table")?;
        debug!("workflows schema ready");
        Ok(())
    }
}

fn upsert_query(record: &CanonicalWorkflow) -> QueryBuilder<'_, Postgres> {
    let mut qb: QueryBuilder<'_, Postgres> =
        QueryBuilder::new(format!("INSERT INTO workflows ({COLUMNS}) "));
    qb.push_values(std::iter::once(record), |mut b, r| {
        b.push_bind(r.id.as_str())
            .push_bind(r.workflow.as_str())
            .push_bind(r.platform.as_str())
            .push_bind(r.source_id.as_str())
            .push_bind(r.source_url.as_deref())
            .push_bind(Json(&r.keywords))
            .push_bind(r.country.as_deref())
            .push_bind(Json(&r.popularity_metrics))
            .push_bind(r.popularity_score)
            .push_bind(Json(r.score_components))
            .push_bind(r.evidence_count)
            .push_bind(r.last_updated);
    });
    // Existing rows keep their id.
    qb.push(
        " ON CONFLICT (source_id) DO UPDATE SET
            workflow = EXCLUDED.workflow,
            platform = EXCLUDED.platform,
            source_url = EXCLUDED.source_url,
            keywords = EXCLUDED.keywords,
            country = EXCLUDED.country,
            popularity_metrics = EXCLUDED.popularity_metrics,
            popularity_score = EXCLUDED.popularity_score,
            score_components = EXCLUDED.score_components,
            evidence_count = EXCLUDED.evidence_count,
            last_updated = EXCLUDED.last_updated",
    );
    qb
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, filters: &WorkflowFilters) {
    qb.push(" WHERE TRUE");
    if let Some(platform) = &filters.platform {
        qb.push(" AND platform = ").push_bind(platform.clone());
    }
    if let Some(country) = &filters.country {
        qb.push(" AND country = ").push_bind(country.clone());
    }
    if let Some(text) = &filters.text {
        qb.push(" AND workflow ILIKE ")
            .push_bind(format!("%{}%", escape_like(text)));
    }
}

/// `%`, `_` and `\` in user text match literally.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn record_from_row(row: &PgRow) -> Result<CanonicalWorkflow, sqlx::Error> {
    let keywords: Option<Json<Vec<String>>> = row.try_get("keywords")?;
    let metrics: Option<Json<PopularityMetrics>> = row.try_get("popularity_metrics")?;
    let components: Option<Json<ScoreComponents>> = row.try_get("score_components")?;
    let last_updated: DateTime<Utc> = row.try_get("last_updated")?;
    Ok(CanonicalWorkflow {
        id: row.try_get("id")?,
        workflow: row.try_get("workflow")?,
        platform: row.try_get("platform")?,
        source_id: row.try_get("source_id")?,
        source_url: row.try_get("source_url")?,
        keywords: keywords.map(|k| k.0).unwrap_or_default(),
        country: row.try_get("country")?,
        popularity_metrics: metrics.map(|m| m.0).unwrap_or_default(),
        popularity_score: row.try_get("popularity_score")?,
        score_components: components.map(|c| c.0).unwrap_or_default(),
        evidence_count: row.try_get("evidence_count")?,
        last_updated,
        evidence: Vec::new(),
    })
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn upsert(&self, record: &CanonicalWorkflow) -> Result<()> {
        upsert_query(record)
            .build()
            .persistent(false)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting {}", record.source_id))?;
        Ok(())
    }

    #[instrument(skip(self, filters))]
    async fn query_workflows(
        &self,
        filters: &WorkflowFilters,
        limit: i64,
        offset: i64,
    ) -> Result<WorkflowPage> {
        let mut count: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM workflows");
        push_filters(&mut count, filters);
        let total: i64 = count
            .build_query_scalar::<i64>()
            .persistent(false)
            .fetch_one(&self.pool)
            .await
            .context("counting workflows")?;

        let mut qb: QueryBuilder<'_, Postgres> =
            QueryBuilder::new(format!("SELECT {COLUMNS} FROM workflows"));
        push_filters(&mut qb, filters);
        qb.push(" ORDER BY popularity_score DESC, workflow ASC LIMIT ")
            .push_bind(limit.max(0))
            .push(" OFFSET ")
            .push_bind(offset.max(0));
        let rows = qb
            .build()
            .persistent(false)
            .fetch_all(&self.pool)
            .await
            .context("querying workflows")?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()
            .context("decoding workflow row")?;
        Ok(WorkflowPage { records, total })
    }

    /// One transaction per ingest run so a half-written run is never visible.
    async fn save(&self, records: &[CanonicalWorkflow]) -> Result<usize> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        for record in records {
            upsert_query(record)
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("upserting {}", record.source_id))?;
        }
        tx.commit().await.context("committing workflows")?;
        info!(count = records.len(), "workflows upserted");
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("slack"), "slack");
    }

    #[test]
    fn filters_render_in_order() {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("SELECT 1 FROM workflows");
        push_filters(
            &mut qb,
            &WorkflowFilters {
                platform: Some("YouTube".into()),
                country: None,
                text: Some("slack".into()),
            },
        );
        assert_eq!(
            qb.sql(),
            "SELECT 1 FROM workflows WHERE TRUE AND platform = $1 AND workflow ILIKE $2"
        );
    }

    #[test]
    fn upsert_never_rewrites_id() {
        let record = CanonicalWorkflow {
            id: "7a0c0d7e-2f0b-4c57-9a59-2f3b2f1d9e11".into(),
            workflow: "Slack alerts".into(),
            platform: "YouTube".into(),
            source_id: "youtube:a".into(),
            source_url: None,
            keywords: vec![],
            country: None,
            popularity_metrics: PopularityMetrics::default(),
            popularity_score: 0.5,
            score_components: ScoreComponents::default(),
            evidence_count: 1,
            last_updated: Utc::now(),
            evidence: vec![],
        };
        let qb = upsert_query(&record);
        let sql = qb.sql();
        assert!(sql.starts_with("INSERT INTO workflows (id, workflow,"));
        assert!(sql.contains("ON CONFLICT (source_id) DO UPDATE SET"));
        assert!(!sql.contains("id = EXCLUDED.id"));
    }
}

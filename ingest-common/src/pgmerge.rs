//! # PgMergeEngine
//!
//! Merges `staging_rows` into `production_rows` with set based statements.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{MergeError, StoreError};
use crate::merge::{record_outcome, MergeEngine, MergeOutcome};
use crate::staging::{NewStagingRow, ProductionRow, StagingRow};

#[derive(Clone)]
pub struct PgMergeEngine {
    pool: PgPool,
}

impl PgMergeEngine {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk load rows into staging. The insertion sequence follows the slice order.
    pub async fn insert_staging_rows(&self, rows: &[NewStagingRow]) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        // Flatten the rows into one vec per column, for PG to unnest
        let mut job_ids = Vec::with_capacity(rows.len());
        let mut record_keys = Vec::with_capacity(rows.len());
        let mut payload_fingerprints = Vec::with_capacity(rows.len());
        let mut source_systems = Vec::with_capacity(rows.len());
        let mut ingested_ats: Vec<DateTime<Utc>> = Vec::with_capacity(rows.len());
        let mut attributes = Vec::with_capacity(rows.len());

        for row in rows {
            job_ids.push(row.job_id);
            record_keys.push(row.record_key.clone());
            payload_fingerprints.push(row.payload_fingerprint.clone());
            source_systems.push(row.source_system.clone());
            ingested_ats.push(row.ingested_at);
            attributes.push(row.attributes.clone());
        }

        let result = sqlx::query(
            r#"
INSERT INTO staging_rows
    (job_id, record_key, payload_fingerprint, source_system, ingested_at, attributes)
SELECT job_id, record_key, payload_fingerprint, source_system, ingested_at, attributes
FROM UNNEST(
    $1::uuid[],
    $2::text[],
    $3::text[],
    $4::text[],
    $5::timestamptz[],
    $6::jsonb[]
) WITH ORDINALITY AS t(job_id, record_key, payload_fingerprint, source_system, ingested_at, attributes, ord)
ORDER BY ord
            "#,
        )
        .bind(&job_ids)
        .bind(&record_keys)
        .bind(&payload_fingerprints)
        .bind(&source_systems)
        .bind(&ingested_ats)
        .bind(&attributes)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("INSERT"))?;

        Ok(result.rows_affected())
    }

    pub async fn staged_rows(&self, job_id: Uuid) -> Result<Vec<StagingRow>, StoreError> {
        sqlx::query_as(
            r#"
SELECT seq, job_id, record_key, payload_fingerprint, source_system, ingested_at, attributes
FROM staging_rows
WHERE job_id = $1
ORDER BY seq
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT"))
    }

    pub async fn production_row(
        &self,
        record_key: &str,
    ) -> Result<Option<ProductionRow>, StoreError> {
        sqlx::query_as(
            r#"
SELECT record_key, payload_fingerprint, source_system, attributes, last_job_id, created_at, updated_at
FROM production_rows
WHERE record_key = $1
            "#,
        )
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query("SELECT"))
    }

    async fn merge_in_transaction(&self, job_id: Uuid) -> Result<MergeOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::transaction("BEGIN"))?;

        // Merges serialize on production so the classification below can't go stale
        // before the writes. Plain readers are not blocked.
        sqlx::query("LOCK TABLE production_rows IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(StoreError::query("LOCK"))?;

        let counts = sqlx::query(
            r#"
WITH deduped AS (
    SELECT DISTINCT ON (record_key)
        record_key,
        payload_fingerprint,
        source_system,
        attributes
    FROM staging_rows
    WHERE job_id = $1
    ORDER BY record_key, ingested_at DESC, seq DESC
),
classified AS (
    SELECT
        deduped.*,
        CASE
            WHEN production_rows.record_key IS NULL THEN 'new'
            WHEN production_rows.payload_fingerprint = deduped.payload_fingerprint THEN 'unchanged'
            ELSE 'changed'
        END AS change
    FROM deduped
    LEFT JOIN production_rows ON production_rows.record_key = deduped.record_key
),
inserted AS (
    INSERT INTO production_rows
        (record_key, payload_fingerprint, source_system, attributes, last_job_id, created_at, updated_at)
    SELECT record_key, payload_fingerprint, source_system, attributes, $1, NOW(), NOW()
    FROM classified
    WHERE change = 'new'
    RETURNING record_key
),
updated AS (
    UPDATE production_rows
    SET
        payload_fingerprint = classified.payload_fingerprint,
        source_system = classified.source_system,
        attributes = classified.attributes,
        last_job_id = $1,
        updated_at = NOW()
    FROM classified
    WHERE
        classified.change = 'changed'
        AND production_rows.record_key = classified.record_key
    RETURNING production_rows.record_key
)
SELECT
    (SELECT COUNT(*) FROM inserted) AS inserted,
    (SELECT COUNT(*) FROM updated) AS updated,
    (SELECT COUNT(*) FROM classified WHERE change = 'unchanged') AS unchanged
            "#,
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::query("MERGE"))?;

        let inserted: i64 = counts
            .try_get("inserted")
            .map_err(StoreError::query("MERGE"))?;
        let updated: i64 = counts
            .try_get("updated")
            .map_err(StoreError::query("MERGE"))?;
        let unchanged: i64 = counts
            .try_get("unchanged")
            .map_err(StoreError::query("MERGE"))?;

        let cleared = sqlx::query("DELETE FROM staging_rows WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::query("DELETE"))?;

        tx.commit()
            .await
            .map_err(StoreError::transaction("COMMIT"))?;

        debug!(
            job_id = %job_id,
            staging_rows = cleared.rows_affected(),
            "cleared staging rows"
        );

        Ok(MergeOutcome {
            inserted: inserted as u64,
            updated: updated as u64,
            unchanged: unchanged as u64,
        })
    }
}

#[async_trait]
impl MergeEngine for PgMergeEngine {
    async fn merge(&self, job_id: Uuid) -> Result<MergeOutcome, MergeError> {
        let outcome = self
            .merge_in_transaction(job_id)
            .await
            .map_err(|error| MergeError::Aborted { job_id, error })?;

        record_outcome(&outcome);
        info!(
            job_id = %job_id,
            inserted = outcome.inserted,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            "merged staging rows into production"
        );

        Ok(outcome)
    }

    async fn discard_staging(&self, job_id: Uuid) -> Result<u64, MergeError> {
        let result = sqlx::query("DELETE FROM staging_rows WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query("DELETE"))?;

        Ok(result.rows_affected())
    }
}

//! # PgControlStore
//!
//! The control store implemented on top of the `process_control` PostgreSQL table.
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tracing::warn;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, NewJob, Registration, RowCounts, QUEUED_MESSAGE, RETRY_MESSAGE, RUNNING_MESSAGE};
use crate::store::ControlStore;

const JOB_COLUMNS: &str = r#"
    id,
    source_fingerprint,
    source_location,
    source_system,
    status,
    enqueue_token,
    started_at,
    finished_at,
    rows_read,
    rows_loaded,
    rows_rejected,
    message,
    error_details,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgControlStore {
    pool: PgPool,
}

impl PgControlStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ControlStore for PgControlStore {
    async fn create_or_get(&self, job: NewJob) -> Result<Registration, StoreError> {
        // A fresh token per call: if it comes back on the row, this call is the one
        // that (re)queued the job. Two racing submissions can't both see their token.
        let token = Uuid::now_v7();
        let query = format!(
            r#"
INSERT INTO process_control
    (id, source_fingerprint, source_location, source_system, status, enqueue_token, message, created_at, updated_at)
VALUES
    ($1, $2, $3, $4, 'pending'::job_status, $5, $6, NOW(), NOW())
ON CONFLICT (source_fingerprint) DO UPDATE
SET
    source_location = EXCLUDED.source_location,
    source_system = EXCLUDED.source_system,
    status = CASE WHEN process_control.status = 'failed'::job_status
        THEN 'pending'::job_status ELSE process_control.status END,
    enqueue_token = CASE WHEN process_control.status = 'failed'::job_status
        THEN EXCLUDED.enqueue_token ELSE process_control.enqueue_token END,
    finished_at = CASE WHEN process_control.status = 'failed'::job_status
        THEN NULL ELSE process_control.finished_at END,
    error_details = CASE WHEN process_control.status = 'failed'::job_status
        THEN NULL ELSE process_control.error_details END,
    message = CASE WHEN process_control.status = 'failed'::job_status
        THEN $7 ELSE process_control.message END,
    updated_at = NOW()
RETURNING {JOB_COLUMNS}
            "#
        );

        let row: Job = sqlx::query_as(&query)
            .bind(job.id)
            .bind(&job.fingerprint)
            .bind(&job.location)
            .bind(&job.system)
            .bind(token)
            .bind(QUEUED_MESSAGE)
            .bind(RETRY_MESSAGE)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query("INSERT"))?;

        Ok(Registration::from_token(row, token))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM process_control WHERE id = $1");

        sqlx::query_as(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query("SELECT"))
    }

    async fn try_claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
UPDATE process_control
SET
    status = 'running'::job_status,
    started_at = NOW(),
    finished_at = NULL,
    message = $2,
    updated_at = NOW()
WHERE
    id = $1
    AND status = 'pending'::job_status
            "#,
        )
        .bind(id)
        .bind(RUNNING_MESSAGE)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("UPDATE"))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        counts: RowCounts,
        message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE process_control
SET
    status = 'completed'::job_status,
    finished_at = NOW(),
    rows_read = $2,
    rows_loaded = $3,
    rows_rejected = $4,
    message = $5,
    error_details = NULL,
    updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counts.rows_read)
        .bind(counts.rows_loaded)
        .bind(counts.rows_rejected)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("UPDATE"))?;

        if result.rows_affected() == 0 {
            warn!(job_id = %id, "completed a job that is not in the control store");
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        error_details: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
UPDATE process_control
SET
    status = 'failed'::job_status,
    finished_at = NOW(),
    message = $2,
    error_details = $3,
    updated_at = NOW()
WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(error_details)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query("UPDATE"))?;

        if result.rows_affected() == 0 {
            warn!(job_id = %id, "failed a job that is not in the control store");
        }
        Ok(())
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        sqlx::query_scalar(
            r#"
SELECT id
FROM process_control
WHERE status = 'pending'::job_status
ORDER BY created_at, id
LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::query("SELECT"))
    }
}

//! # MemoryStore
//!
//! A control store and merge engine kept in process memory. Every operation takes
//! one lock, so each of them is atomic the same way the PostgreSQL versions are.
//! Used by tests and by local runs without a database.
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{MergeError, StoreError};
use crate::job::{
    Job, JobStatus, NewJob, Registration, RowCounts, QUEUED_MESSAGE, RETRY_MESSAGE,
    RUNNING_MESSAGE,
};
use crate::merge::{record_outcome, MergeEngine, MergeOutcome, MergePlan};
use crate::staging::{NewStagingRow, ProductionRow, StagingRow};
use crate::store::ControlStore;

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    by_fingerprint: HashMap<String, Uuid>,
    staging: Vec<StagingRow>,
    last_seq: i64,
    production: HashMap<String, ProductionRow>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append rows to staging, assigning increasing sequence numbers.
    pub fn stage(&self, rows: Vec<NewStagingRow>) -> u64 {
        let mut state = self.state();
        let count = rows.len() as u64;
        for row in rows {
            state.last_seq += 1;
            let seq = state.last_seq;
            state.staging.push(StagingRow {
                seq,
                job_id: row.job_id,
                record_key: row.record_key,
                payload_fingerprint: row.payload_fingerprint,
                source_system: row.source_system,
                ingested_at: row.ingested_at,
                attributes: row.attributes,
            });
        }
        count
    }

    pub fn staged_rows(&self, job_id: Uuid) -> Vec<StagingRow> {
        self.state()
            .staging
            .iter()
            .filter(|row| row.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn production_row(&self, record_key: &str) -> Option<ProductionRow> {
        self.state().production.get(record_key).cloned()
    }

    /// All production rows, sorted by record key.
    pub fn production_rows(&self) -> Vec<ProductionRow> {
        let mut rows: Vec<ProductionRow> = self.state().production.values().cloned().collect();
        rows.sort_by(|a, b| a.record_key.cmp(&b.record_key));
        rows
    }
}

#[async_trait]
impl ControlStore for MemoryStore {
    async fn create_or_get(&self, new_job: NewJob) -> Result<Registration, StoreError> {
        let mut guard = self.state();
        let state = &mut *guard;
        let now = Utc::now();
        let token = Uuid::now_v7();

        let existing = state.by_fingerprint.get(&new_job.fingerprint).copied();
        let job = match existing.and_then(|id| state.jobs.get_mut(&id)) {
            Some(job) => {
                job.source_location = new_job.location;
                job.source_system = new_job.system;
                if job.status == JobStatus::Failed {
                    job.status = JobStatus::Pending;
                    job.enqueue_token = token;
                    job.finished_at = None;
                    job.error_details = None;
                    job.message = Some(RETRY_MESSAGE.to_owned());
                }
                job.updated_at = now;
                job.clone()
            }
            None => {
                let job = Job {
                    id: new_job.id,
                    source_fingerprint: new_job.fingerprint.clone(),
                    source_location: new_job.location,
                    source_system: new_job.system,
                    status: JobStatus::Pending,
                    enqueue_token: token,
                    started_at: None,
                    finished_at: None,
                    rows_read: 0,
                    rows_loaded: 0,
                    rows_rejected: 0,
                    message: Some(QUEUED_MESSAGE.to_owned()),
                    error_details: None,
                    created_at: now,
                    updated_at: now,
                };
                state.by_fingerprint.insert(new_job.fingerprint, job.id);
                state.jobs.insert(job.id, job.clone());
                job
            }
        };

        Ok(Registration::from_token(job, token))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.state().jobs.get(&id).cloned())
    }

    async fn try_claim(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                let now = Utc::now();
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                job.finished_at = None;
                job.message = Some(RUNNING_MESSAGE.to_owned());
                job.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        counts: RowCounts,
        message: &str,
    ) -> Result<(), StoreError> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            let now = Utc::now();
            job.status = JobStatus::Completed;
            job.finished_at = Some(now);
            job.rows_read = counts.rows_read;
            job.rows_loaded = counts.rows_loaded;
            job.rows_rejected = counts.rows_rejected;
            job.message = Some(message.to_owned());
            job.error_details = None;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        error_details: &str,
    ) -> Result<(), StoreError> {
        if let Some(job) = self.state().jobs.get_mut(&id) {
            let now = Utc::now();
            job.status = JobStatus::Failed;
            job.finished_at = Some(now);
            job.message = Some(message.to_owned());
            job.error_details = Some(error_details.to_owned());
            job.updated_at = now;
        }
        Ok(())
    }

    async fn list_pending(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let state = self.state();
        let mut pending: Vec<&Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .collect();
        pending.sort_by_key(|job| (job.created_at, job.id));

        Ok(pending
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|job| job.id)
            .collect())
    }
}

#[async_trait]
impl MergeEngine for MemoryStore {
    async fn merge(&self, job_id: Uuid) -> Result<MergeOutcome, MergeError> {
        let mut state = self.state();
        let state = &mut *state;

        let (staged, kept): (Vec<StagingRow>, Vec<StagingRow>) = std::mem::take(&mut state.staging)
            .into_iter()
            .partition(|row| row.job_id == job_id);
        state.staging = kept;

        let plan = MergePlan::build(staged, |key| {
            state
                .production
                .get(key)
                .map(|row| row.payload_fingerprint.as_str())
        });
        let outcome = plan.outcome();

        let production = &mut state.production;

        let now = Utc::now();
        for row in plan.inserts {
            production.insert(
                row.record_key.clone(),
                ProductionRow {
                    record_key: row.record_key,
                    payload_fingerprint: row.payload_fingerprint,
                    source_system: row.source_system,
                    attributes: row.attributes,
                    last_job_id: job_id,
                    created_at: now,
                    updated_at: now,
                },
            );
        }
        for row in plan.updates {
            if let Some(current) = production.get_mut(&row.record_key) {
                current.payload_fingerprint = row.payload_fingerprint;
                current.source_system = row.source_system;
                current.attributes = row.attributes;
                current.last_job_id = job_id;
                current.updated_at = now;
            }
        }

        record_outcome(&outcome);
        Ok(outcome)
    }

    async fn discard_staging(&self, job_id: Uuid) -> Result<u64, MergeError> {
        let mut state = self.state();
        let before = state.staging.len();
        state.staging.retain(|row| row.job_id != job_id);
        Ok((before - state.staging.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn new_job(fingerprint: &str) -> NewJob {
        NewJob::new(fingerprint, "/data/source.csv", "ExternalProvider")
    }

    fn staged(job_id: Uuid, key: &str, fingerprint: &str) -> NewStagingRow {
        NewStagingRow::new(
            job_id,
            key,
            fingerprint,
            "ExternalProvider",
            json!({ "fingerprint": fingerprint }),
        )
    }

    #[tokio::test]
    async fn test_create_or_get_is_idempotent() {
        let store = MemoryStore::new();

        let first = store.create_or_get(new_job("abc")).await.unwrap();
        let second = store.create_or_get(new_job("abc")).await.unwrap();

        assert!(first.enqueue);
        assert!(!second.enqueue);
        assert_eq!(first.job.id, second.job.id);
        assert_eq!(second.job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_failed_job_is_revived_once() {
        let store = MemoryStore::new();
        let id = store.create_or_get(new_job("abc")).await.unwrap().job.id;
        assert!(store.try_claim(id).await.unwrap());
        store.mark_failed(id, "boom", "details").await.unwrap();

        let revived = store.create_or_get(new_job("abc")).await.unwrap();
        let again = store.create_or_get(new_job("abc")).await.unwrap();

        assert!(revived.enqueue);
        assert_eq!(revived.job.id, id);
        assert_eq!(revived.job.status, JobStatus::Pending);
        assert_eq!(revived.job.error_details, None);
        assert_eq!(revived.job.message.as_deref(), Some(RETRY_MESSAGE));
        assert!(!again.enqueue);
    }

    #[tokio::test]
    async fn test_completed_job_is_not_requeued() {
        let store = MemoryStore::new();
        let id = store.create_or_get(new_job("abc")).await.unwrap().job.id;
        assert!(store.try_claim(id).await.unwrap());
        store
            .mark_completed(id, RowCounts::default(), "done")
            .await
            .unwrap();

        let registration = store.create_or_get(new_job("abc")).await.unwrap();

        assert!(!registration.enqueue);
        assert_eq!(registration.job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_claim_only_from_pending() {
        let store = MemoryStore::new();
        let id = store.create_or_get(new_job("abc")).await.unwrap().job.id;

        assert!(store.try_claim(id).await.unwrap());
        assert!(!store.try_claim(id).await.unwrap());
        assert!(!store.try_claim(Uuid::now_v7()).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn test_list_pending_in_creation_order() {
        let store = MemoryStore::new();
        let a = store.create_or_get(new_job("a")).await.unwrap().job.id;
        let b = store.create_or_get(new_job("b")).await.unwrap().job.id;
        let c = store.create_or_get(new_job("c")).await.unwrap().job.id;
        assert!(store.try_claim(b).await.unwrap());

        assert_eq!(store.list_pending(10).await.unwrap(), vec![a, c]);
        assert_eq!(store.list_pending(1).await.unwrap(), vec![a]);
    }

    #[tokio::test]
    async fn test_merge_writes_only_changes_and_clears_staging() {
        let store = MemoryStore::new();
        let first_job = Uuid::now_v7();
        store.stage(vec![
            staged(first_job, "k1", "h1"),
            staged(first_job, "k2", "h2"),
        ]);

        let outcome = store.merge(first_job).await.unwrap();
        assert_eq!(outcome.inserted, 2);
        assert!(store.staged_rows(first_job).is_empty());
        let before = store.production_row("k1").unwrap();

        let second_job = Uuid::now_v7();
        store.stage(vec![
            staged(second_job, "k1", "h1"),
            staged(second_job, "k2", "h2-changed"),
            staged(second_job, "k3", "h3"),
        ]);

        let outcome = store.merge(second_job).await.unwrap();
        assert_eq!(
            outcome,
            MergeOutcome {
                inserted: 1,
                updated: 1,
                unchanged: 1
            }
        );
        assert_eq!(store.production_row("k1").unwrap(), before);
        let k2 = store.production_row("k2").unwrap();
        assert_eq!(k2.payload_fingerprint, "h2-changed");
        assert_eq!(k2.last_job_id, second_job);
        assert_eq!(store.production_rows().len(), 3);
    }

    #[tokio::test]
    async fn test_merge_takes_latest_row_per_key() {
        let store = MemoryStore::new();
        let job_id = Uuid::now_v7();
        let now = Utc::now();
        store.stage(vec![
            staged(job_id, "k", "newest").ingested_at(now),
            staged(job_id, "k", "oldest").ingested_at(now - Duration::minutes(5)),
            staged(job_id, "k", "middle").ingested_at(now - Duration::minutes(1)),
        ]);

        let outcome = store.merge(job_id).await.unwrap();

        assert_eq!(outcome.inserted, 1);
        assert_eq!(store.production_row("k").unwrap().payload_fingerprint, "newest");
    }

    #[tokio::test]
    async fn test_merge_leaves_other_jobs_staging_alone() {
        let store = MemoryStore::new();
        let ours = Uuid::now_v7();
        let theirs = Uuid::now_v7();
        store.stage(vec![staged(ours, "a", "1"), staged(theirs, "b", "2")]);

        store.merge(ours).await.unwrap();

        assert!(store.production_row("b").is_none());
        assert_eq!(store.staged_rows(theirs).len(), 1);
        assert_eq!(store.discard_staging(theirs).await.unwrap(), 1);
        assert!(store.staged_rows(theirs).is_empty());
    }

    #[tokio::test]
    async fn test_merge_of_empty_staging_is_a_no_op() {
        let store = MemoryStore::new();
        let outcome = store.merge(Uuid::now_v7()).await.unwrap();
        assert_eq!(outcome, MergeOutcome::default());
    }
}

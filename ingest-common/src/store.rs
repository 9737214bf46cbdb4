use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::job::{Job, NewJob, Registration, RowCounts};

/// Durable record of one job per content fingerprint.
///
/// Every state change is a single conditional write in the underlying store, so
/// the guarantees below hold across processes and not only within one worker.
#[async_trait]
pub trait ControlStore: Send + Sync {
    /// Insert a Pending job for an unseen fingerprint, or return the existing one.
    /// An existing Failed job is reset to Pending with its error cleared, any other
    /// status is left alone. Descriptive fields are refreshed in every case.
    async fn create_or_get(&self, job: NewJob) -> Result<Registration, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Transition a job from Pending to Running. Returns false, without error, if the
    /// job is in any other state (or doesn't exist). At most one caller wins per job.
    async fn try_claim(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn mark_completed(
        &self,
        id: Uuid,
        counts: RowCounts,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: Uuid, message: &str, error_details: &str)
        -> Result<(), StoreError>;

    /// Ids of Pending jobs, oldest first.
    async fn list_pending(&self, limit: i64) -> Result<Vec<Uuid>, StoreError>;
}

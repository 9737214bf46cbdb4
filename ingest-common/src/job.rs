use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Enumeration of possible statuses for a Job.
/// Pending: waiting in the queue for a worker to claim it.
/// Running: claimed by a worker, transform and merge in progress.
/// Completed: rows were merged into production.
/// Failed: processing stopped with an error, a resubmission makes it Pending again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            invalid => Err(StoreError::ParseJobStatusError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One ingestion job, as recorded in `process_control`.
/// There is exactly one Job per source fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    pub source_fingerprint: String,
    pub source_location: String,
    pub source_system: String,
    pub status: JobStatus,
    // Rewritten whenever a submission creates or revives the job, see `Registration`.
    #[serde(skip)]
    pub enqueue_token: Uuid,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub rows_read: i64,
    pub rows_loaded: i64,
    pub rows_rejected: i64,
    pub message: Option<String>,
    pub error_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The data needed to register a job for a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: Uuid,
    pub fingerprint: String,
    pub location: String,
    pub system: String,
}

impl NewJob {
    /// Build a NewJob with a fresh time-ordered id.
    pub fn new(fingerprint: &str, location: &str, system: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            fingerprint: fingerprint.to_owned(),
            location: location.to_owned(),
            system: system.to_owned(),
        }
    }
}

/// Outcome of `ControlStore::create_or_get`.
#[derive(Debug, Clone)]
pub struct Registration {
    /// The job for the fingerprint, as it is after the call.
    pub job: Job,
    /// True only if this call created the job or revived it from Failed.
    /// Callers must enqueue the job id when this is set, and only then.
    pub enqueue: bool,
}

impl Registration {
    pub(crate) fn from_token(job: Job, token: Uuid) -> Self {
        let enqueue = job.enqueue_token == token;
        Self { job, enqueue }
    }
}

/// Row accounting reported by the transform and recorded on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowCounts {
    pub rows_read: i64,
    pub rows_loaded: i64,
    pub rows_rejected: i64,
}

pub(crate) const RETRY_MESSAGE: &str = "Retry requested";
pub(crate) const QUEUED_MESSAGE: &str = "Queued";
pub(crate) const RUNNING_MESSAGE: &str = "Processing";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_round_trips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!(matches!(
            "paused".parse::<JobStatus>(),
            Err(StoreError::ParseJobStatusError(s)) if s == "paused"
        ));
    }

    #[test]
    fn test_new_jobs_get_distinct_ids() {
        let a = NewJob::new("abc", "/data/a.csv", "ExternalProvider");
        let b = NewJob::new("abc", "/data/a.csv", "ExternalProvider");
        assert_ne!(a.id, b.id);
    }
}

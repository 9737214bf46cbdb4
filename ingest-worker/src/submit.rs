use std::sync::Arc;

use ingest_common::fingerprint::file_fingerprint;
use ingest_common::{ControlStore, Job, JobStatus, NewJob};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{SourceError, SubmitError};
use crate::queue::JobProducer;
use crate::source::SourceResolver;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub fingerprint: String,
}

/// Entry point for new source files: registers a job per distinct file content
/// and hands new (or revived) jobs to the worker.
#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn ControlStore>,
    producer: JobProducer,
    sources: SourceResolver,
}

impl Submitter {
    pub fn new(store: Arc<dyn ControlStore>, producer: JobProducer, sources: SourceResolver) -> Self {
        Self {
            store,
            producer,
            sources,
        }
    }

    pub async fn submit(
        &self,
        source_path: &str,
        source_system: &str,
    ) -> Result<SubmitResponse, SubmitError> {
        let path = self.sources.resolve(source_path)?;
        let fingerprint =
            file_fingerprint(&path)
                .await
                .map_err(|error| SourceError::Unreadable {
                    path: source_path.to_owned(),
                    error,
                })?;

        let registration = self
            .store
            .create_or_get(NewJob::new(&fingerprint, source_path.trim(), source_system))
            .await?;
        let job = registration.job;

        if registration.enqueue {
            self.producer.enqueue(job.id)?;
            info!(job_id = %job.id, fingerprint = %fingerprint, "job enqueued");
        } else {
            info!(
                job_id = %job.id,
                fingerprint = %fingerprint,
                status = %job.status,
                "source already submitted"
            );
        }

        Ok(SubmitResponse {
            job_id: job.id,
            status: job.status,
            fingerprint,
        })
    }

    pub async fn status(&self, job_id: Uuid) -> Result<Option<Job>, SubmitError> {
        Ok(self.store.get(job_id).await?)
    }
}

use std::sync::Arc;
use std::time::{Duration, Instant};

use health::HealthHandle;
use ingest_common::fingerprint::file_fingerprint;
use ingest_common::{ControlStore, Job, MergeEngine, MergeOutcome, RowCounts};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ProcessingError, SourceError, TransformError, WorkerError};
use crate::queue::{JobConsumer, JobProducer};
use crate::source::SourceResolver;
use crate::transform::{TransformEngine, TransformRequest};

/// What happened to one dequeued job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(RowCounts),
    Failed,
    /// The job was not Pending, or vanished after the claim.
    Skipped,
}

/// Runs claimed jobs one at a time: transform into staging, merge into production,
/// record the terminal state.
pub struct IngestWorker {
    store: Arc<dyn ControlStore>,
    merge: Arc<dyn MergeEngine>,
    transform: Arc<dyn TransformEngine>,
    consumer: JobConsumer,
    sources: SourceResolver,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
    heartbeat_interval: Duration,
    chunk_size: u32,
    connection_string: String,
}

impl IngestWorker {
    pub fn new(
        store: Arc<dyn ControlStore>,
        merge: Arc<dyn MergeEngine>,
        transform: Arc<dyn TransformEngine>,
        consumer: JobConsumer,
        sources: SourceResolver,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            store,
            merge,
            transform,
            consumer,
            sources,
            liveness,
            heartbeat_interval: Duration::from_secs(10),
            chunk_size: 200_000,
            connection_string: String::new(),
        }
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn chunk_size(mut self, chunk_size: u32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Connection string handed to the transform so it can write to staging.
    pub fn connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = connection_string.to_owned();
        self
    }

    /// Process jobs until `shutdown` is cancelled or the queue closes.
    /// A job in progress when `shutdown` fires has its transform cancelled, and ends Failed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("ingest worker started");

        loop {
            self.liveness.report_healthy().await;

            let dequeued =
                tokio::time::timeout(self.heartbeat_interval, self.consumer.dequeue(&shutdown))
                    .await;
            let id = match dequeued {
                Err(_idle) => continue,
                Ok(None) => break,
                Ok(Some(id)) => id,
            };

            self.process(id, &shutdown).await;
        }

        info!("ingest worker stopped");
    }

    /// Claim and process one job. Never fails: errors end up on the job.
    pub async fn process(&self, id: Uuid, shutdown: &CancellationToken) -> JobOutcome {
        metrics::counter!("ingest_jobs_total").increment(1);

        match self.store.try_claim(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %id, "job is not pending, skipping");
                metrics::counter!("ingest_jobs_claim_missed").increment(1);
                return JobOutcome::Skipped;
            }
            Err(error) => return self.fail(id, ProcessingError::Store(error)).await,
        }

        let job = match self.store.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %id, "claimed job is missing from the control store");
                return JobOutcome::Skipped;
            }
            Err(error) => return self.fail(id, ProcessingError::Store(error)).await,
        };

        info!(
            job_id = %id,
            fingerprint = %job.source_fingerprint,
            source = %job.source_location,
            "processing job"
        );

        let started = Instant::now();
        let heartbeat = spawn_heartbeat(self.liveness.clone(), self.heartbeat_interval);
        let result = self.execute(&job, shutdown).await;
        heartbeat.abort();
        metrics::histogram!("ingest_job_duration_seconds").record(started.elapsed().as_secs_f64());

        let (transformed, merged) = match result {
            Ok(result) => result,
            Err(error) => return self.fail(id, error).await,
        };

        let counts = RowCounts {
            rows_read: transformed.rows_read,
            rows_loaded: i64::try_from(merged.written()).unwrap_or(i64::MAX),
            rows_rejected: transformed.rows_rejected,
        };
        let summary = summary(&transformed, &merged);

        if let Err(error) = self.store.mark_completed(id, counts, &summary).await {
            return self.fail(id, ProcessingError::Store(error)).await;
        }

        metrics::counter!("ingest_jobs_completed").increment(1);
        info!(job_id = %id, "{}", summary);
        JobOutcome::Completed(counts)
    }

    /// Transform and merge. Returns the transform counts and the merge outcome.
    async fn execute(
        &self,
        job: &Job,
        shutdown: &CancellationToken,
    ) -> Result<(RowCounts, MergeOutcome), ProcessingError> {
        let path = self.sources.resolve(&job.source_location)?;
        let fingerprint =
            file_fingerprint(&path)
                .await
                .map_err(|error| SourceError::Unreadable {
                    path: path.display().to_string(),
                    error,
                })?;

        if fingerprint != job.source_fingerprint {
            return Err(TransformError::FingerprintMismatch {
                expected: job.source_fingerprint.clone(),
                actual: fingerprint,
            }
            .into());
        }

        // Rows left behind by a failed attempt would be merged with the fresh ones.
        let discarded = self.merge.discard_staging(job.id).await?;
        if discarded > 0 {
            info!(job_id = %job.id, rows = discarded, "discarded staging rows of a previous attempt");
        }

        let request = TransformRequest {
            job_id: job.id,
            source_path: path,
            fingerprint,
            source_system: job.source_system.clone(),
            chunk_size: self.chunk_size,
            connection_string: self.connection_string.clone(),
        };
        let transformed = self
            .transform
            .run(&request, shutdown.child_token())
            .await?;
        debug!(
            job_id = %job.id,
            rows_read = transformed.rows_read,
            rows_loaded = transformed.rows_loaded,
            rows_rejected = transformed.rows_rejected,
            "transform finished"
        );

        let merged = self.merge.merge(job.id).await?;

        Ok((transformed, merged))
    }

    async fn fail(&self, id: Uuid, error: ProcessingError) -> JobOutcome {
        error!(job_id = %id, "job failed: {}", error);
        metrics::counter!("ingest_jobs_failed").increment(1);

        if let Err(store_error) = self
            .store
            .mark_failed(id, error.short_message(), &error.details())
            .await
        {
            error!(job_id = %id, "failed to record job failure: {}", store_error);
        }

        JobOutcome::Failed
    }
}

fn summary(transformed: &RowCounts, merged: &MergeOutcome) -> String {
    format!(
        "Completed: {} rows read, {} rejected, {} inserted, {} updated, {} unchanged",
        transformed.rows_read,
        transformed.rows_rejected,
        merged.inserted,
        merged.updated,
        merged.unchanged
    )
}

/// Keep reporting healthy while a job runs, jobs can outlast the liveness deadline.
fn spawn_heartbeat(liveness: HealthHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            liveness.report_healthy().await;
        }
    })
}

/// Put Pending jobs back on the queue, oldest first. Their queue entries don't
/// survive a restart; a job that is already queued is skipped at claim time.
pub async fn requeue_pending(
    store: &dyn ControlStore,
    producer: &JobProducer,
    limit: i64,
) -> Result<usize, WorkerError> {
    let pending = store.list_pending(limit).await?;
    for id in &pending {
        producer.enqueue(*id)?;
    }

    if !pending.is_empty() {
        info!(jobs = pending.len(), "re-enqueued pending jobs");
    }
    Ok(pending.len())
}

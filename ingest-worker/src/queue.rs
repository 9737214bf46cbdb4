//! In-process FIFO of job ids between the submission layer and the worker.
//!
//! Many producers, one consumer. Deduplication happens before enqueueing: only
//! the submission that created or revived a job enqueues it.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::QueueClosed;

const QUEUE_DEPTH_GAUGE: &str = "ingest_queue_depth";

pub fn job_queue() -> (JobProducer, JobConsumer) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (JobProducer { sender }, JobConsumer { receiver })
}

#[derive(Clone)]
pub struct JobProducer {
    sender: mpsc::UnboundedSender<Uuid>,
}

impl JobProducer {
    /// Never blocks. Fails only once the consumer has been dropped.
    pub fn enqueue(&self, id: Uuid) -> Result<(), QueueClosed> {
        self.sender.send(id).map_err(|error| QueueClosed(error.0))?;
        metrics::gauge!(QUEUE_DEPTH_GAUGE).increment(1.0);
        Ok(())
    }
}

pub struct JobConsumer {
    receiver: mpsc::UnboundedReceiver<Uuid>,
}

impl JobConsumer {
    /// Wait for the next id. Returns None once `shutdown` is cancelled or every
    /// producer is gone. Cancel safe: an id is never lost if this future is dropped.
    pub async fn dequeue(&mut self, shutdown: &CancellationToken) -> Option<Uuid> {
        let id = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            id = self.receiver.recv() => id,
        };

        if id.is_some() {
            metrics::gauge!(QUEUE_DEPTH_GAUGE).decrement(1.0);
        }
        id
    }
}

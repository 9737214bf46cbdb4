use std::error::Error as _;
use std::time::Duration;

use ingest_common::{MergeError, StoreError};
use thiserror::Error;
use uuid::Uuid;

/// Errors resolving or reading a submitted source file.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("{path} is not a valid source path: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("source file {path} could not be read: {error}")]
    Unreadable {
        path: String,
        error: std::io::Error,
    },
}

/// Enumeration of errors raised by the transform engine.
#[derive(Error, Debug)]
pub enum TransformError {
    #[error("failed to start transform program {program}: {error}")]
    Spawn {
        program: String,
        error: std::io::Error,
    },
    #[error("i/o error while running the transform: {0}")]
    Io(#[from] std::io::Error),
    #[error("transform exited with {}: {stderr}", exit_code(.code))]
    Exit { code: Option<i32>, stderr: String },
    #[error("transform produced a malformed result: {0}")]
    MalformedResult(String),
    #[error("source fingerprint is {actual}, expected {expected}")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("transform was cancelled")]
    Cancelled,
    #[error("transform timed out after {0:?}")]
    Timeout(Duration),
}

fn exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (killed by a signal)".to_owned(),
    }
}

/// Why processing a claimed job failed. Recorded on the job, never propagated out of the worker loop.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error(transparent)]
    SourceFile(#[from] SourceError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProcessingError {
    /// User facing summary, stored as the job message.
    pub fn short_message(&self) -> &'static str {
        match self {
            ProcessingError::SourceFile(_) => "Source file unavailable",
            ProcessingError::Transform(TransformError::Cancelled) => "Transform cancelled",
            ProcessingError::Transform(TransformError::Timeout(_)) => "Transform timed out",
            ProcessingError::Transform(TransformError::FingerprintMismatch { .. }) => {
                "Source file changed after submission"
            }
            ProcessingError::Transform(_) => "Transform failed",
            ProcessingError::Merge(_) => "Merge failed",
            ProcessingError::Store(_) => "Control store error",
        }
    }

    /// The error and its chain of causes, stored as the job error details.
    pub fn details(&self) -> String {
        let mut details = self.to_string();
        let mut source = self.source();
        while let Some(cause) = source {
            let cause_message = cause.to_string();
            if !details.contains(&cause_message) {
                details.push_str("\ncaused by: ");
                details.push_str(&cause_message);
            }
            source = cause.source();
        }
        details
    }
}

/// The job queue consumer is gone, nothing can be enqueued anymore.
#[derive(Error, Debug)]
#[error("job queue is closed, could not enqueue job {0}")]
pub struct QueueClosed(pub Uuid);

/// Errors returned to the submission layer.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidPath(String),
    #[error("source file {path} could not be read: {error}")]
    SourceFile {
        path: String,
        error: std::io::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

impl From<SourceError> for SubmitError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::InvalidPath { .. } => SubmitError::InvalidPath(error.to_string()),
            SourceError::Unreadable { path, error } => SubmitError::SourceFile { path, error },
        }
    }
}

/// Enumeration of errors related to starting the worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred while starting the worker: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueClosed),
}

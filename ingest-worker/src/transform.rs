//! # Transform Engine
//!
//! Reads a source file and loads its rows into staging for one job, reporting
//! row counts. The production implementation runs an external program.
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use ingest_common::RowCounts;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransformError;

/// Stderr kept for error details, the tail end of it.
const MAX_STDERR_BYTES: usize = 64 * 1024;

/// Everything the transform needs to load one job's rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformRequest {
    pub job_id: Uuid,
    pub source_path: PathBuf,
    pub fingerprint: String,
    pub source_system: String,
    pub chunk_size: u32,
    pub connection_string: String,
}

#[async_trait]
pub trait TransformEngine: Send + Sync {
    /// Load the rows of `request.source_path` into staging under `request.job_id`.
    /// Must stop, and return `TransformError::Cancelled`, once `cancel` is cancelled.
    async fn run(
        &self,
        request: &TransformRequest,
        cancel: CancellationToken,
    ) -> Result<RowCounts, TransformError>;
}

/// Runs a transform program as a child process.
///
/// The program gets the request as arguments:
/// `--parquet-path --process-id --source-hash --source-system --chunk-size --connection-string`.
/// `--parquet-path` carries the source file whatever its format.
///
/// The program writes its rows to `staging_rows` through the connection string:
/// `job_id` is the process id, `record_key` and `payload_fingerprint` are built with
/// `ingest_common::fingerprint`, `attributes` holds the record as JSON. `seq` and
/// `ingested_at` are left to their column defaults.
///
/// Lines it prints starting with `PROGRESS` are logged. The last non-empty line of
/// stdout must be a JSON object with `rowsRead`, `rowsLoaded` and `rowsRejected`.
#[derive(Debug, Clone)]
pub struct ProcessTransform {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl ProcessTransform {
    /// `args` are passed before the request arguments, e.g. the script to run.
    pub fn new(program: &str, args: Vec<String>) -> Self {
        Self {
            program: program.to_owned(),
            args,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, request: &TransformRequest) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--parquet-path")
            .arg(&request.source_path)
            .arg("--process-id")
            .arg(request.job_id.to_string())
            .arg("--source-hash")
            .arg(&request.fingerprint)
            .arg("--source-system")
            .arg(&request.source_system)
            .arg("--chunk-size")
            .arg(request.chunk_size.to_string())
            .arg("--connection-string")
            .arg(&request.connection_string)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

enum Exit {
    Finished(std::io::Result<ExitStatus>, std::io::Result<Option<String>>, std::io::Result<String>),
    Cancelled,
    TimedOut(Duration),
}

#[async_trait]
impl TransformEngine for ProcessTransform {
    async fn run(
        &self,
        request: &TransformRequest,
        cancel: CancellationToken,
    ) -> Result<RowCounts, TransformError> {
        let mut child = self
            .command(request)
            .spawn()
            .map_err(|error| TransformError::Spawn {
                program: self.program.clone(),
                error,
            })?;
        debug!(job_id = %request.job_id, program = %self.program, "transform started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("transform stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("transform stderr was not captured"))?;

        let job_id = request.job_id;
        let run = async {
            let (last_line, stderr) = tokio::join!(
                follow_stdout(stdout, job_id),
                read_tail(stderr, MAX_STDERR_BYTES)
            );
            let status = child.wait().await;
            Exit::Finished(status, last_line, stderr)
        };

        let exit = tokio::select! {
            exit = run => exit,
            _ = cancel.cancelled() => Exit::Cancelled,
            elapsed = deadline(self.timeout) => Exit::TimedOut(elapsed),
        };

        let (status, last_line, stderr) = match exit {
            Exit::Finished(status, last_line, stderr) => (status?, last_line?, stderr?),
            Exit::Cancelled => {
                stop(&mut child, job_id).await;
                return Err(TransformError::Cancelled);
            }
            Exit::TimedOut(elapsed) => {
                stop(&mut child, job_id).await;
                return Err(TransformError::Timeout(elapsed));
            }
        };

        if !status.success() {
            return Err(TransformError::Exit {
                code: status.code(),
                stderr: stderr.trim().to_owned(),
            });
        }

        parse_result(last_line.as_deref(), request)
    }
}

async fn deadline(timeout: Option<Duration>) -> Duration {
    match timeout {
        Some(timeout) => {
            tokio::time::sleep(timeout).await;
            timeout
        }
        None => std::future::pending().await,
    }
}

async fn stop(child: &mut tokio::process::Child, job_id: Uuid) {
    if let Err(error) = child.kill().await {
        warn!(job_id = %job_id, "failed to kill transform process: {}", error);
    }
}

/// Log progress lines, return the last non-empty line.
async fn follow_stdout<R>(stdout: R, job_id: Uuid) -> std::io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    let mut last = None;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(progress) = line.strip_prefix("PROGRESS") {
            info!(job_id = %job_id, progress = progress.trim(), "transform progress");
        }
        last = Some(line.to_owned());
    }

    Ok(last)
}

/// Read to the end, keeping at most the last `limit` bytes.
async fn read_tail<R>(mut reader: R, limit: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        kept.extend_from_slice(&buffer[..read]);
        if kept.len() > limit * 2 {
            kept.drain(..kept.len() - limit);
        }
    }

    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransformResult {
    #[serde(default, alias = "processId")]
    job_id: Option<String>,
    #[serde(default)]
    source_hash: Option<String>,
    rows_read: i64,
    rows_loaded: i64,
    rows_rejected: i64,
}

/// Parse the result line printed by a transform program.
pub fn parse_result(
    last_line: Option<&str>,
    request: &TransformRequest,
) -> Result<RowCounts, TransformError> {
    let line = last_line.ok_or_else(|| {
        TransformError::MalformedResult("transform printed nothing on stdout".to_owned())
    })?;

    let result: TransformResult = serde_json::from_str(line).map_err(|error| {
        TransformError::MalformedResult(format!("{error} in result line {line:?}"))
    })?;

    if let Some(job_id) = result.job_id.as_deref() {
        if job_id != request.job_id.to_string() {
            return Err(TransformError::MalformedResult(format!(
                "result is for job {job_id}, expected {}",
                request.job_id
            )));
        }
    }

    match result.source_hash.as_deref() {
        Some(hash) if !hash.is_empty() && hash != request.fingerprint => {
            return Err(TransformError::FingerprintMismatch {
                expected: request.fingerprint.clone(),
                actual: hash.to_owned(),
            });
        }
        _ => {}
    }

    if result.rows_read < 0 || result.rows_loaded < 0 || result.rows_rejected < 0 {
        return Err(TransformError::MalformedResult(format!(
            "negative row counts in result line {line:?}"
        )));
    }

    Ok(RowCounts {
        rows_read: result.rows_read,
        rows_loaded: result.rows_loaded,
        rows_rejected: result.rows_rejected,
    })
}

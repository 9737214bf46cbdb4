use thiserror::Error;

/// Enumeration of errors raised by the control store and the staging/production tables.
/// Errors that originate from sqlx are wrapped to record which operation failed.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("pool creation failed with: {error}")]
    PoolCreationError { error: sqlx::Error },
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
    #[error("{0} is not a valid JobStatus")]
    ParseJobStatusError(String),
}

impl StoreError {
    pub(crate) fn query(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
        move |error| StoreError::QueryError {
            command: command.to_owned(),
            error,
        }
    }

    pub(crate) fn transaction(command: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
        move |error| StoreError::TransactionError {
            command: command.to_owned(),
            error,
        }
    }
}

/// Errors raised while merging a job's staging rows into production.
/// Any of these means the merge transaction was rolled back.
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("merge of job {job_id} aborted: {error}")]
    Aborted { job_id: uuid::Uuid, error: StoreError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

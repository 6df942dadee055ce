use crate::ids::{BatchId, TaskId};

/// Errors surfaced by the [`Store`](crate::store::Store) layer, split
/// between I/O and SQL failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("invalid json in column: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error type returned by the public facade and services.
#[derive(Debug, thiserror::Error)]
pub enum TemError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("batch code {0:?} is already in use")]
    DuplicateBatchCode(String),

    #[error("no batch with id {0}")]
    BatchNotFound(BatchId),

    #[error("no task with id {0}")]
    TaskNotFound(TaskId),

    #[error("no handler registered for task type {0:?}")]
    NoHandler(String),

    #[error("concurrency must be strictly positive")]
    InvalidConcurrency,

    #[error("{0}")]
    InvalidArgument(String),
}

pub type TemResult<T> = Result<T, TemError>;

//! Error types and their classification.

use thiserror::Error;

use super::ids::JobId;

/// Errors reported by the job store gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),

    /// A conditional update lost against another writer (lease race,
    /// duplicate insert). Normal under concurrency, not a fault.
    #[error("concurrent modification of job {0}")]
    Conflict(JobId),

    /// The store could not be reached or refused the operation.
    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::Permanent,
            StoreError::Conflict(_) => ErrorKind::Transient,
            StoreError::Unavailable(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Failure of a single job execution.
///
/// Any variant sends the job through the failure pipeline; the rendered
/// message becomes the job's `last_failure`.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("no handler registered for handler_type={0}")]
    HandlerNotFound(String),

    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid repeat descriptor: {0}")]
    Recurrence(#[from] RecurrenceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        JobError::Failed(message.into())
    }
}

/// A repeat descriptor the recurrence evaluator cannot interpret.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("malformed descriptor {0:?}")]
    Malformed(String),

    #[error("descriptor {0:?} has a zero interval")]
    ZeroInterval(String),
}

/// Errors surfaced by the scheduler facade and by commands.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("duplicate handler for handler_type={0}")]
    DuplicateHandler(String),

    #[error(transparent)]
    Config(#[from] crate::executor::ConfigError),
}

/// Operational classification of an error.
///
/// - Transient: retrying the same operation is expected to succeed
/// - Permanent: retrying is pointless
/// - Infrastructure: the store or another collaborator is down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

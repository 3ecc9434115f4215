use thiserror::Error;

use cadence_core::CadenceError;

/// Failures of the persistent store. Always transient from the engine's point
/// of view: the affected operation is skipped and retried on a later tick.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A job output could not be encoded or a stored one decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An update targeted a run id that does not exist.
    #[error("Job run not found: {id}")]
    RunNotFound { id: i64 },

    /// The operation did not complete within the configured store timeout.
    #[error("Store operation timed out after {ms}ms")]
    Timeout { ms: u64 },

    /// The store refused the operation (poisoned lock, injected fault, closed handle).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced by the scheduler's public API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Invalid engine configuration.
    #[error(transparent)]
    Config(#[from] CadenceError),

    /// A job's metadata violates the job contract.
    #[error("Invalid job {name:?}: {reason}")]
    InvalidJob { name: String, reason: String },

    /// Two jobs were registered under the same name.
    #[error("Duplicate job name: {name}")]
    DuplicateJob { name: String },

    /// No job with the given name is registered.
    #[error("Job not found: {name}")]
    JobNotFound { name: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a single execution attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The job returned a failed result.
    #[error("{0}")]
    Failed(String),

    /// The job panicked while running.
    #[error("job panicked: {0}")]
    Panicked(String),

    /// The attempt exceeded the job timeout.
    #[error("job timed out after {ms}ms")]
    TimedOut { ms: u64 },
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

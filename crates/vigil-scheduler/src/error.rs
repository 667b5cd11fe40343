//! Error types for the scheduler.

use thiserror::Error;
use vigil_core::TaskId;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] vigil_core::VigilError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No handler is registered for the task type.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// The task reached its terminal failed state.
    #[error("Task {id} permanently failed: {error}")]
    PermanentlyFailed { id: TaskId, error: String },

    /// The handler raised the abort signal.
    #[error("{message} (task {id})")]
    TaskAborted { id: TaskId, message: String },

    /// The most recent attempt failed in a way that is surfaced to waiters
    /// even though the task will be retried (attempt timeouts).
    #[error("Task {id} attempt failed: {message}")]
    AttemptFailed { id: TaskId, message: String },

    /// The task was cancelled.
    #[error("Task {0} was cancelled")]
    Cancelled(TaskId),

    /// The caller's own wait budget ran out.
    #[error("Timed out after {waited_ms}ms waiting for task {id}")]
    WaitTimeout { id: TaskId, waited_ms: u64 },

    /// Executing tasks did not acknowledge their cancellation in time.
    #[error("Timed out waiting for {pending} task(s) to acknowledge cancellation")]
    CancelTimeout { pending: usize },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

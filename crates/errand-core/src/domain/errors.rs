//! Error types and their classification.
//!
//! Three families, one per audience:
//! - [`StorageError`]: the task store failed or refused a write.
//! - [`HandlerError`]: a handler's unit of work failed; always translated into
//!   a task transition by the executor, never returned to API callers.
//! - [`SchedulerError`]: a caller-facing request was rejected.

use std::time::Duration;

use thiserror::Error;

use super::ids::TaskId;
use super::state::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("task {0} already exists")]
    Duplicate(TaskId),

    #[error("task {id} is {actual}, expected {expected}")]
    Conflict {
        id: TaskId,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("illegal transition for task {id}: {from} -> {to}")]
    IllegalTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {id} is {status} and can no longer change")]
    Terminal { id: TaskId, status: TaskStatus },

    #[error("invalid update: {0}")]
    Invalid(String),
}

impl StorageError {
    /// Worth retrying the same operation?
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Operational classification of an execution error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry may succeed (I/O hiccup, rate limit, timeout).
    Transient,
    /// Retry is pointless (bad parameters, permission denied).
    Permanent,
    /// The store behind the scheduler failed.
    Infrastructure,
    /// Not a failure: the task was asked to stop.
    Cancelled,
}

/// Failure reported by a task handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::Transient(_) | HandlerError::TimedOut(_) => ErrorKind::Transient,
            HandlerError::Permanent(_) => ErrorKind::Permanent,
            HandlerError::Cancelled => ErrorKind::Cancelled,
            HandlerError::Storage(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Rejected caller request. Distinct from a task that ran and failed.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Admission error: never enters Pending.
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("command does not require background processing: {0}")]
    NotBackgroundCommand(String),

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("{requester} is not allowed to access task {task_id}")]
    Unauthorized { task_id: TaskId, requester: String },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn only_unavailable_is_transient() {
        let id = TaskId::from_ulid(Ulid::new());
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(!StorageError::NotFound(id).is_transient());
        assert!(!StorageError::Invalid("x".into()).is_transient());
    }

    #[test]
    fn handler_error_kinds() {
        assert_eq!(HandlerError::transient("io").kind(), ErrorKind::Transient);
        assert_eq!(
            HandlerError::TimedOut(Duration::from_secs(1)).kind(),
            ErrorKind::Transient
        );
        assert_eq!(HandlerError::permanent("bad").kind(), ErrorKind::Permanent);
        assert_eq!(HandlerError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            HandlerError::from(StorageError::Unavailable("down".into())).kind(),
            ErrorKind::Infrastructure
        );
    }

    #[test]
    fn handler_error_message_is_the_cause() {
        assert_eq!(HandlerError::transient("rate limited").to_string(), "rate limited");
    }
}

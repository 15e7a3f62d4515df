// SPDX-License-Identifier: MIT
//! Semantic errors surfaced by the scheduler core.
//!
//! The repository translates raw storage failures into [`CoreError::Storage`];
//! the scheduler service adds validation errors on top; everything else
//! propagates unchanged. Notification and callback failures never become
//! errors on the producer/worker request path — they are logged and counted.

use crate::model::Task;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Bad input from the caller (empty command, malformed webhook, …).
    #[error("validation: {0}")]
    Validation(String),

    /// Task (or subscription) hash entry is missing. Terminal for the caller.
    #[error("not found: {0}")]
    NotFound(String),

    /// Lease-holder mismatch. Fatal to this attempt, not to the task.
    #[error("worker does not own the lease on task {task_id}")]
    NotOwner { task_id: String },

    /// State guard violated — the lease usually expired and the task was
    /// already requeued or finished by someone else.
    #[error("task {task_id} is not in progress")]
    NotInProgress { task_id: String },

    /// Lost a SET-IF-NOT-EXISTS race on the idempotency mapping; the boxed
    /// task is the winner's record.
    #[error("idempotency key already mapped to task {}", .0.id)]
    IdempotencyConflict(Box<Task>),

    /// Transient store / I/O failure. No local retry in the core path.
    #[error("storage: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Storage(format!("corrupt record: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_task_context() {
        let err = CoreError::NotOwner {
            task_id: "t-1".into(),
        };
        assert_eq!(err.to_string(), "worker does not own the lease on task t-1");

        let err = CoreError::NotInProgress {
            task_id: "t-2".into(),
        };
        assert!(err.to_string().contains("t-2"));
    }
}

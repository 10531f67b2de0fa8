//! Error types for pool operations and task outcomes.

use std::fmt;

use thiserror::Error;

use super::task::Task;

/// Errors produced by pool operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The pool is draining or stopped and accepts no new tasks.
    #[error("pool is closed")]
    PoolClosed,
    /// The intake queue is full; retry later.
    #[error("task queue is full")]
    QueueFull,
    /// `start` was called on a pool that is not in the `Created` state.
    #[error("pool has already been started")]
    AlreadyStarted,
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Internal failure, such as a worker thread that could not be spawned.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A rejected submission, carrying the task back to the caller.
#[derive(Error)]
#[error("{error}")]
pub struct SubmitError<P> {
    /// Why the task was rejected.
    pub error: PoolError,
    task: Task<P>,
}

impl<P> SubmitError<P> {
    pub(crate) const fn new(error: PoolError, task: Task<P>) -> Self {
        Self { error, task }
    }

    /// Take back the rejected task, e.g. to retry it.
    #[must_use]
    pub fn into_task(self) -> Task<P> {
        self.task
    }

    /// The rejected task.
    #[must_use]
    pub const fn task(&self) -> &Task<P> {
        &self.task
    }

    /// True when the rejection is transient backpressure.
    #[must_use]
    pub fn is_queue_full(&self) -> bool {
        self.error == PoolError::QueueFull
    }
}

impl<P> fmt::Debug for SubmitError<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubmitError")
            .field("error", &self.error)
            .field("task_id", &self.task.id())
            .finish()
    }
}

/// Why a task was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The task deadline elapsed before or during execution.
    DeadlineExceeded,
    /// Shutdown's grace period elapsed before the task finished.
    ShutdownTimeout,
    /// The pool was cancelled.
    ExplicitCancel,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
            Self::ShutdownTimeout => write!(f, "shutdown timeout"),
            Self::ExplicitCancel => write!(f, "explicit cancel"),
        }
    }
}

/// Failure reported by a task payload.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload returned an error; passed through untouched.
    #[error(transparent)]
    Returned(#[from] anyhow::Error),
    /// The payload panicked; the message is the panic payload if it was a
    /// string.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;

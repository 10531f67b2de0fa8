//! Tasks and their terminal outcomes.

use std::fmt;
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::error::{CancelReason, PayloadError};

/// Opaque task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a fresh random identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A unit of work submitted to a pool.
///
/// Built by the caller, then owned by the pool from acceptance until its
/// outcome is delivered.
pub struct Task<P> {
    id: TaskId,
    payload: P,
    deadline: Option<Instant>,
    submitted_at: Instant,
}

impl<P> Task<P> {
    /// Wrap a payload in a task with a fresh identifier and no deadline.
    pub fn new(payload: P) -> Self {
        Self {
            id: TaskId::new(),
            payload,
            deadline: None,
            submitted_at: Instant::now(),
        }
    }

    /// Use a caller-chosen identifier.
    #[must_use]
    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    /// Set an absolute deadline. A task whose deadline has passed when a
    /// worker picks it up is cancelled without running.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Task identifier.
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Task payload.
    pub const fn payload(&self) -> &P {
        &self.payload
    }

    /// Absolute deadline, if any.
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// When the pool accepted the task (construction time until then).
    pub const fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Stamp the acceptance time and return the deadline the pool enforces:
    /// the explicit one, else `submitted_at + default_timeout`. The task's
    /// own deadline is left untouched so a rejected task goes back as it was.
    pub(crate) fn stamp(&mut self, default_timeout: Option<Duration>) -> Option<Instant> {
        self.submitted_at = Instant::now();
        self.deadline
            .or_else(|| default_timeout.map(|t| self.submitted_at + t))
    }

    pub(crate) fn into_parts(self, deadline: Option<Instant>) -> (P, TaskMetadata) {
        let meta = TaskMetadata {
            id: self.id,
            deadline,
            submitted_at: self.submitted_at,
        };
        (self.payload, meta)
    }
}

impl<P: fmt::Debug> fmt::Debug for Task<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Task metadata visible to executors.
#[derive(Debug, Clone, Copy)]
pub struct TaskMetadata {
    /// Task identifier.
    pub id: TaskId,
    /// Absolute deadline, if any.
    pub deadline: Option<Instant>,
    /// When the pool accepted the task.
    pub submitted_at: Instant,
}

impl TaskMetadata {
    /// True if the deadline is set and has passed at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// Terminal result of a task.
#[derive(Debug)]
pub enum OutcomeKind<R> {
    /// The payload returned a value.
    Succeeded(R),
    /// The payload returned an error or panicked.
    Failed(PayloadError),
    /// The task was cancelled before or during execution.
    Cancelled(CancelReason),
}

/// The single terminal outcome of an accepted task.
#[derive(Debug)]
pub struct Outcome<R> {
    /// Identifier of the task this outcome belongs to.
    pub task_id: TaskId,
    /// Success value, failure or cancellation.
    pub kind: OutcomeKind<R>,
    /// When execution started. Equal to `finished_at` for tasks that never ran.
    pub started_at: Instant,
    /// When the outcome was produced.
    pub finished_at: Instant,
    /// Slot index of the worker that produced the outcome, if any.
    pub worker: Option<usize>,
}

impl<R> Outcome<R> {
    pub(crate) fn never_started(task_id: TaskId, reason: CancelReason, worker: Option<usize>) -> Self {
        let now = Instant::now();
        Self {
            task_id,
            kind: OutcomeKind::Cancelled(reason),
            started_at: now,
            finished_at: now,
            worker,
        }
    }

    /// True if the payload returned a value.
    pub fn is_success(&self) -> bool {
        matches!(self.kind, OutcomeKind::Succeeded(_))
    }

    /// The cancellation reason, if the task was cancelled.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        match self.kind {
            OutcomeKind::Cancelled(reason) => Some(reason),
            _ => None,
        }
    }

    /// Time between start and finish.
    pub fn run_time(&self) -> Duration {
        self.finished_at.saturating_duration_since(self.started_at)
    }

    /// Convert into a plain `Result`, mapping cancellations to an error.
    ///
    /// # Errors
    ///
    /// Returns the payload error, or an error describing the cancellation.
    pub fn into_result(self) -> Result<R, anyhow::Error> {
        match self.kind {
            OutcomeKind::Succeeded(value) => Ok(value),
            OutcomeKind::Failed(err) => Err(err.into()),
            OutcomeKind::Cancelled(reason) => {
                Err(anyhow::anyhow!("task {} cancelled: {reason}", self.task_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_applies_default_timeout() {
        let mut task = Task::new(());
        let deadline = task.stamp(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(deadline - task.submitted_at(), Duration::from_secs(5));
        assert!(task.deadline().is_none());
    }

    #[test]
    fn test_stamp_keeps_explicit_deadline() {
        let explicit = Instant::now() + Duration::from_secs(60);
        let mut task = Task::new(()).with_deadline(explicit);
        assert_eq!(task.stamp(Some(Duration::from_secs(1))), Some(explicit));
    }

    #[test]
    fn test_metadata_expiry() {
        let now = Instant::now();
        let (_, meta) = Task::new(()).into_parts(Some(now));
        assert!(meta.is_expired_at(now));

        let (_, meta) = Task::new(()).into_parts(None);
        assert!(!meta.is_expired_at(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_outcome_into_result() {
        let id = TaskId::new();
        let ok = Outcome {
            task_id: id,
            kind: OutcomeKind::Succeeded(3),
            started_at: Instant::now(),
            finished_at: Instant::now(),
            worker: Some(0),
        };
        assert!(ok.is_success());
        assert_eq!(ok.into_result().unwrap(), 3);

        let cancelled: Outcome<i32> = Outcome::never_started(id, CancelReason::DeadlineExceeded, None);
        assert_eq!(cancelled.cancel_reason(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(cancelled.run_time(), Duration::ZERO);
        let err = cancelled.into_result().unwrap_err();
        assert!(err.to_string().contains("deadline exceeded"));
    }
}

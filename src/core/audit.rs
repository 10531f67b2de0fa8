//! Pool event sinks.
//!
//! A pool can be given an [`EventSink`] that records every acceptance,
//! rejection, start, finish and state change. The in-memory sink keeps a
//! bounded ring for tests and diagnostics.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::clock::now_ms;

use super::task::TaskId;
use super::worker_pool::PoolState;

/// What happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEventKind {
    /// A task entered the intake queue.
    Accepted,
    /// A submission was turned away; carries the error text.
    Rejected(String),
    /// A worker started executing a task.
    Started,
    /// A task reached its terminal outcome; carries a short label
    /// (`succeeded`, `failed`, `cancelled: <reason>`).
    Finished(String),
    /// The pool changed lifecycle state.
    StateChanged {
        /// Previous state.
        from: PoolState,
        /// New state.
        to: PoolState,
    },
}

/// A recorded pool event.
#[derive(Debug, Clone)]
pub struct PoolEvent {
    /// Name of the pool that emitted the event.
    pub pool: String,
    /// Related task, if any.
    pub task_id: Option<TaskId>,
    /// Worker slot, if any.
    pub worker: Option<usize>,
    /// What happened.
    pub kind: PoolEventKind,
    /// Timestamp in milliseconds since the epoch.
    pub created_at_ms: u128,
}

/// Receives pool events. Called from worker and submitter threads.
pub trait EventSink: Send {
    /// Record an event.
    fn record(&mut self, event: PoolEvent);
}

/// In-memory event sink for testing and dev.
pub struct InMemoryEventSink {
    events: VecDeque<PoolEvent>,
    max_events: usize,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    #[must_use]
    pub fn new(max_events: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(max_events),
            max_events,
        }
    }

    /// Retrieve a snapshot of stored events.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.iter().cloned().collect()
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&mut self, event: PoolEvent) {
        if self.events.len() >= self.max_events {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// A shared sink: the pool records into it while the caller keeps a handle
/// to inspect it.
impl<S: EventSink> EventSink for Arc<Mutex<S>> {
    fn record(&mut self, event: PoolEvent) {
        self.lock().record(event);
    }
}

/// Sink that logs every event with `tracing` at debug level.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&mut self, event: PoolEvent) {
        tracing::debug!(
            pool = %event.pool,
            task_id = ?event.task_id,
            worker_id = ?event.worker,
            kind = ?event.kind,
            "pool event"
        );
    }
}

/// Helper to build an event stamped with the current time.
pub fn build_pool_event(
    pool: impl Into<String>,
    task_id: Option<TaskId>,
    worker: Option<usize>,
    kind: PoolEventKind,
) -> PoolEvent {
    PoolEvent {
        pool: pool.into(),
        task_id,
        worker,
        kind,
        created_at_ms: now_ms(),
    }
}

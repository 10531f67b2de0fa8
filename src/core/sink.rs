//! Outcome sink: bounded buffer between workers and outcome consumers.
//!
//! The sink counts the outcomes it is owed. A slot is reserved when a task is
//! accepted and released either by delivering the task's outcome or, if the
//! hand-off to the intake fails afterwards, by cancelling the reservation.
//! Consumers see the end of the stream only once the pool has stopped and
//! every reservation is settled, so an accepted task can never fall off the
//! end of the stream.
//!
//! In [`OutcomeOrdering::Submission`] mode outcomes are keyed by the
//! acceptance sequence number and held in a reorder buffer until every
//! earlier sequence number is settled. Only releasable outcomes count against
//! the capacity bound, so a full buffer never blocks the head-of-line outcome
//! behind parked ones.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

use crate::config::OutcomeOrdering;

use super::task::Outcome;

/// Why a non-blocking or timed receive returned without an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OutcomeRecvError {
    /// No outcome is buffered right now.
    #[error("no outcome available")]
    Empty,
    /// No outcome arrived before the timeout.
    #[error("timed out waiting for an outcome")]
    Timeout,
    /// The pool has stopped and every outcome has been delivered.
    #[error("outcome stream ended")]
    Ended,
}

enum Pop<R> {
    Item(Outcome<R>),
    Empty,
    Ended,
}

struct SinkState<R> {
    ready: VecDeque<Outcome<R>>,
    /// Submission mode only; `None` marks a sequence number whose
    /// reservation was cancelled.
    parked: BTreeMap<u64, Option<Outcome<R>>>,
    next_seq: u64,
    owed: usize,
    closed: bool,
}

impl<R> SinkState<R> {
    fn flush_parked(&mut self) {
        while let Some(entry) = self.parked.remove(&self.next_seq) {
            if let Some(outcome) = entry {
                self.ready.push_back(outcome);
            }
            self.next_seq += 1;
        }
    }
}

pub(crate) struct OutcomeSink<R> {
    state: Mutex<SinkState<R>>,
    space: Condvar,
    available: Condvar,
    notify: Notify,
    capacity: usize,
    ordering: OutcomeOrdering,
}

impl<R> OutcomeSink<R> {
    pub(crate) fn new(capacity: usize, ordering: OutcomeOrdering) -> Self {
        Self {
            state: Mutex::new(SinkState {
                ready: VecDeque::with_capacity(capacity.min(1024)),
                parked: BTreeMap::new(),
                next_seq: 0,
                owed: 0,
                closed: false,
            }),
            space: Condvar::new(),
            available: Condvar::new(),
            notify: Notify::new(),
            capacity,
            ordering,
        }
    }

    /// Reserve an outcome slot for an accepted task.
    pub(crate) fn reserve(&self) {
        self.state.lock().owed += 1;
    }

    /// Cancel the reservation for `seq`; its task never reached the intake.
    pub(crate) fn cancel_reservation(&self, seq: u64) {
        let mut state = self.state.lock();
        state.owed = state.owed.saturating_sub(1);
        if self.ordering == OutcomeOrdering::Submission {
            state.parked.insert(seq, None);
            state.flush_parked();
        }
        drop(state);
        self.wake_consumers();
    }

    /// Deliver an outcome, blocking while the buffer is full.
    pub(crate) fn deliver(&self, seq: u64, outcome: Outcome<R>) {
        self.push(seq, outcome, true);
    }

    /// Deliver an outcome regardless of the capacity bound.
    pub(crate) fn deliver_forced(&self, seq: u64, outcome: Outcome<R>) {
        self.push(seq, outcome, false);
    }

    fn push(&self, seq: u64, outcome: Outcome<R>, wait_for_space: bool) {
        let mut state = self.state.lock();
        let releasable = self.ordering == OutcomeOrdering::Unordered || seq == state.next_seq;
        if wait_for_space && releasable {
            while !state.closed && state.ready.len() >= self.capacity {
                self.space.wait(&mut state);
            }
        }
        state.owed = state.owed.saturating_sub(1);
        match self.ordering {
            OutcomeOrdering::Unordered => state.ready.push_back(outcome),
            OutcomeOrdering::Submission => {
                state.parked.insert(seq, Some(outcome));
                state.flush_parked();
            }
        }
        drop(state);
        self.wake_consumers();
    }

    /// Mark the producing side finished. Producers stop waiting for space and
    /// consumers see the end once the owed count reaches zero.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.space.notify_all();
        self.wake_consumers();
    }

    #[cfg(test)]
    pub(crate) fn owed(&self) -> usize {
        self.state.lock().owed
    }

    pub(crate) fn buffered(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.parked.values().filter(|o| o.is_some()).count()
    }

    fn wake_consumers(&self) {
        self.available.notify_all();
        self.notify.notify_waiters();
    }

    fn try_pop(&self) -> Pop<R> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.ready.pop_front() {
            drop(state);
            self.space.notify_one();
            return Pop::Item(outcome);
        }
        if state.closed && state.owed == 0 {
            Pop::Ended
        } else {
            Pop::Empty
        }
    }

    fn pop_until(&self, deadline: Option<Instant>) -> Result<Outcome<R>, OutcomeRecvError> {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.ready.pop_front() {
                drop(state);
                self.space.notify_one();
                return Ok(outcome);
            }
            if state.closed && state.owed == 0 {
                return Err(OutcomeRecvError::Ended);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && state.ready.is_empty()
                    {
                        return Err(if state.closed && state.owed == 0 {
                            OutcomeRecvError::Ended
                        } else {
                            OutcomeRecvError::Timeout
                        });
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }
}

/// Consumer handle on a pool's outcome stream.
///
/// Any number of handles may exist; each outcome is delivered to exactly one
/// of them. The stream ends once the pool has stopped and every accepted
/// task's outcome has been received.
pub struct Outcomes<R> {
    sink: Arc<OutcomeSink<R>>,
}

impl<R> Clone for Outcomes<R> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
        }
    }
}

impl<R> Outcomes<R> {
    pub(crate) const fn new(sink: Arc<OutcomeSink<R>>) -> Self {
        Self { sink }
    }

    /// Block until the next outcome, or `None` once the stream has ended.
    pub fn recv(&self) -> Option<Outcome<R>> {
        self.sink.pop_until(None).ok()
    }

    /// Block for at most `timeout`.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived in time, `Ended` if the stream is over.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Outcome<R>, OutcomeRecvError> {
        self.sink.pop_until(Some(Instant::now() + timeout))
    }

    /// Take a buffered outcome without blocking.
    ///
    /// # Errors
    ///
    /// `Empty` if nothing is buffered, `Ended` if the stream is over.
    pub fn try_recv(&self) -> Result<Outcome<R>, OutcomeRecvError> {
        match self.sink.try_pop() {
            Pop::Item(outcome) => Ok(outcome),
            Pop::Empty => Err(OutcomeRecvError::Empty),
            Pop::Ended => Err(OutcomeRecvError::Ended),
        }
    }

    /// Wait asynchronously for the next outcome, or `None` once the stream
    /// has ended. Dropping the future never loses an outcome.
    pub async fn recv_async(&self) -> Option<Outcome<R>> {
        loop {
            let notified = self.sink.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self.sink.try_pop() {
                Pop::Item(outcome) => return Some(outcome),
                Pop::Ended => return None,
                Pop::Empty => notified.await,
            }
        }
    }

    /// Drain everything currently buffered without blocking.
    pub fn drain_ready(&self) -> Vec<Outcome<R>> {
        std::iter::from_fn(|| self.try_recv().ok()).collect()
    }

    /// Outcomes buffered but not yet received.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.sink.buffered()
    }
}

impl<R> Iterator for Outcomes<R> {
    type Item = Outcome<R>;

    fn next(&mut self) -> Option<Self::Item> {
        self.recv()
    }
}

//! Intake queue between submitters and workers.
//!
//! A crossbeam bounded channel holds accepted tasks; capacity `0` gives a
//! rendezvous channel, so a hand-off completes only when a worker receives.
//! Closing drops the pool's sender (workers exit once the channel is empty)
//! and drops the close-signal sender, which wakes every submitter blocked on
//! a full queue.

use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Select, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use super::error::PoolError;
use super::task::Task;

/// An accepted task travelling through the intake.
pub(crate) struct Queued<P> {
    pub task: Task<P>,
    /// Acceptance sequence number, used for outcome ordering.
    pub seq: u64,
    /// Deadline the worker enforces (explicit or defaulted).
    pub deadline: Option<Instant>,
}

pub(crate) struct Intake<P> {
    /// `None` once closed. Senders hold the read lock for the whole send so
    /// that `close` cannot complete while a send is in progress.
    tx: RwLock<Option<Sender<Queued<P>>>>,
    rx: Receiver<Queued<P>>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
    capacity: usize,
}

impl<P> Intake<P> {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        let (close_tx, close_rx) = bounded(0);
        Self {
            tx: RwLock::new(Some(tx)),
            rx,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
            capacity,
        }
    }

    /// Enqueue without blocking.
    pub(crate) fn try_send(&self, item: Queued<P>) -> Result<(), (PoolError, Queued<P>)> {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            return Err((PoolError::PoolClosed, item));
        };
        tx.try_send(item).map_err(|e| match e {
            TrySendError::Full(item) => (PoolError::QueueFull, item),
            TrySendError::Disconnected(item) => (PoolError::PoolClosed, item),
        })
    }

    /// Enqueue, blocking until there is room or the intake closes.
    pub(crate) fn send_blocking(&self, item: Queued<P>) -> Result<(), (PoolError, Queued<P>)> {
        let guard = self.tx.read();
        let Some(tx) = guard.as_ref() else {
            return Err((PoolError::PoolClosed, item));
        };

        let mut sel = Select::new();
        let send_idx = sel.send(tx);
        sel.recv(&self.close_rx);
        let oper = sel.select();
        if oper.index() == send_idx {
            oper.send(tx, item)
                .map_err(|e| (PoolError::PoolClosed, e.into_inner()))
        } else {
            // The close signal never carries a message; this only observes
            // the disconnect.
            let _ = oper.recv(&self.close_rx);
            Err((PoolError::PoolClosed, item))
        }
    }

    /// Stop accepting. Wakes blocked submitters first, then waits for any
    /// in-progress send to finish before dropping the sender.
    pub(crate) fn close(&self) {
        self.close_tx.lock().take();
        self.tx.write().take();
    }

    /// Remove everything still queued.
    pub(crate) fn drain(&self) -> Vec<Queued<P>> {
        self.rx.try_iter().collect()
    }

    pub(crate) fn receiver(&self) -> Receiver<Queued<P>> {
        self.rx.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    pub(crate) const fn capacity(&self) -> usize {
        self.capacity
    }
}

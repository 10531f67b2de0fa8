//! Native implementation of `WorkerPool` using OS threads.
//!
//! Each worker is a dedicated OS thread with its own single-threaded tokio
//! runtime, so CPU-bound payloads never block the caller's runtime.
//!
//! # Design
//!
//! - **No polling**: workers block in a crossbeam `Select`; shutdown and
//!   consumers wait on `Condvar`s.
//! - **One lock for lifecycle**: state, live-worker count and the in-flight
//!   registry share one mutex. Payloads never touch it.
//! - **Claim before report**: an in-flight task's outcome is reported by
//!   whoever removes it from the registry first, the worker on completion or
//!   the controller on abort. The loser stays silent.
//! - **Bounded shutdown**: when the grace period runs out, queued and running
//!   tasks are reported cancelled, running payloads are cancelled and their
//!   futures dropped, and threads stuck in non-yielding code are detached.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Select, Sender};
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{InFlightPolicy, WorkerPoolConfig};
use crate::core::audit::{build_pool_event, EventSink, PoolEventKind};
use crate::core::error::{CancelReason, PayloadError, PoolError, SubmitError};
use crate::core::executor::{TaskContext, WorkerExecutor};
use crate::core::intake::{Intake, Queued};
use crate::core::retry::RetryPolicy;
use crate::core::sink::{OutcomeSink, Outcomes};
use crate::core::task::{Outcome, OutcomeKind, Task, TaskId};

use super::{PoolCounters, PoolState, PoolStats, ShutdownReport};

const DEFAULT_POOL_NAME: &str = "taskcore";

/// How long a forced stop waits for aborted workers to leave before
/// detaching them.
const FORCED_EXIT_WAIT: Duration = Duration::from_millis(100);

/// Registry entry for a task a worker is executing.
struct InFlight {
    task_id: TaskId,
    worker: usize,
    started_at: Instant,
    token: CancellationToken,
    abort: CancellationToken,
}

struct Lifecycle {
    state: PoolState,
    target_workers: usize,
    live_workers: usize,
    next_worker_id: usize,
    next_seq: u64,
    /// Once set, tasks dequeued by workers are reported cancelled with this
    /// reason instead of running.
    abort_queued: Option<CancelReason>,
    in_flight: HashMap<u64, InFlight>,
}

impl Lifecycle {
    /// Spawn workers with `spawn` until `target` are live, then make
    /// `target` the worker count. If a spawn fails the count falls back to
    /// the workers actually live.
    fn grow_to(
        &mut self,
        target: usize,
        mut spawn: impl FnMut(&mut Self) -> Result<(), PoolError>,
    ) -> Result<(), PoolError> {
        while self.live_workers < target {
            if let Err(e) = spawn(self) {
                self.target_workers = self.live_workers;
                return Err(e);
            }
        }
        self.target_workers = target;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerExit {
    Drained,
    Retired,
    RuntimeFailed,
}

struct Shared<P, R, E> {
    name: String,
    config: WorkerPoolConfig,
    executor: E,
    intake: Intake<P>,
    sink: Arc<OutcomeSink<R>>,
    counters: PoolCounters,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_changed: Condvar,
    retire_tx: Sender<()>,
    retire_rx: Receiver<()>,
    /// Parent of every task token.
    pool_token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    events: Mutex<Option<Box<dyn EventSink>>>,
}

/// Worker pool with dedicated OS threads.
///
/// Share it between submitters with `Arc`. See the [module
/// docs](crate::core::worker_pool) for an example.
pub struct WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    shared: Arc<Shared<P, R, E>>,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    /// Create a pool in the `Created` state. No thread is spawned until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: WorkerPoolConfig, executor: E) -> Result<Self, PoolError> {
        Self::named(DEFAULT_POOL_NAME, config, executor)
    }

    /// Like [`new`](Self::new), with a name used for worker thread names and
    /// log fields.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid.
    pub fn named(
        name: impl Into<String>,
        config: WorkerPoolConfig,
        executor: E,
    ) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let name = name.into();
        let (retire_tx, retire_rx) = unbounded();
        let shared = Shared {
            intake: Intake::new(config.queue_capacity),
            sink: Arc::new(OutcomeSink::new(config.outcome_capacity, config.ordering)),
            counters: PoolCounters::default(),
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::Created,
                target_workers: config.worker_count,
                live_workers: 0,
                next_worker_id: 0,
                next_seq: 0,
                abort_queued: None,
                in_flight: HashMap::new(),
            }),
            lifecycle_changed: Condvar::new(),
            retire_tx,
            retire_rx,
            pool_token: CancellationToken::new(),
            handles: Mutex::new(Vec::with_capacity(config.worker_count)),
            events: Mutex::new(None),
            executor,
            config,
            name,
        };

        debug!(
            pool = %shared.name,
            worker_count = shared.config.worker_count,
            queue_capacity = shared.config.queue_capacity,
            "WorkerPool created"
        );

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Install a sink that receives every pool event.
    pub fn set_event_sink(&self, sink: Box<dyn EventSink>) {
        *self.shared.events.lock() = Some(sink);
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Configuration the pool was built with.
    #[must_use]
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PoolState {
        self.shared.lifecycle.lock().state
    }

    /// A consumer handle on the outcome stream.
    #[must_use]
    pub fn outcomes(&self) -> Outcomes<R> {
        Outcomes::new(Arc::clone(&self.shared.sink))
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let (target, live) = {
            let lc = self.shared.lifecycle.lock();
            (lc.target_workers, lc.live_workers)
        };
        self.shared
            .counters
            .snapshot(target, live, self.shared.sink.buffered())
    }

    /// Spawn the worker threads and move to `Running`.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` if the pool has left `Created`. `Internal` if a
    /// worker thread could not be spawned; the pool still runs with the
    /// workers that did start, unless none did.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lc = self.shared.lifecycle.lock();
        if lc.state != PoolState::Created {
            return Err(PoolError::AlreadyStarted);
        }

        let target = lc.target_workers;
        let failure = lc.grow_to(target, |lc| self.shared.spawn_worker(lc)).err();

        if lc.live_workers == 0 {
            lc.target_workers = target;
            return Err(failure.unwrap_or_else(|| PoolError::Internal("no worker started".into())));
        }
        self.shared.transition(&mut lc, PoolState::Running);
        info!(
            pool = %self.shared.name,
            worker_count = lc.live_workers,
            queue_capacity = self.shared.intake.capacity(),
            "WorkerPool started with dedicated OS threads"
        );
        failure.map_or(Ok(()), Err)
    }

    /// Submit without blocking.
    ///
    /// # Errors
    ///
    /// - `QueueFull` if the intake is full (or, with capacity 0, no worker
    ///   is idle). The task is handed back in the error.
    /// - `PoolClosed` if the pool is draining or stopped.
    pub fn try_submit(&self, task: Task<P>) -> Result<TaskId, SubmitError<P>> {
        self.enqueue(task, false)
    }

    /// Submit, blocking while the intake is full.
    ///
    /// A blocked call returns `PoolClosed` as soon as the pool starts
    /// draining.
    ///
    /// # Errors
    ///
    /// `PoolClosed` if the pool is draining or stopped.
    pub fn submit(&self, task: Task<P>) -> Result<TaskId, SubmitError<P>> {
        self.enqueue(task, true)
    }

    /// Non-blocking submit, retrying `QueueFull` rejections with the
    /// policy's backoff. Sleeps the calling thread between attempts.
    ///
    /// # Errors
    ///
    /// The last rejection once attempts are exhausted, or `PoolClosed`
    /// immediately.
    pub fn submit_with_retry(
        &self,
        task: Task<P>,
        policy: &RetryPolicy,
    ) -> Result<TaskId, SubmitError<P>> {
        let mut task = task;
        let mut attempt = 1;
        loop {
            match self.try_submit(task) {
                Ok(id) => return Ok(id),
                Err(err) if err.is_queue_full() => {
                    let Some(delay) = policy.backoff(attempt) else {
                        return Err(err);
                    };
                    debug!(pool = %self.shared.name, attempt, delay_ms = delay.as_millis(), "queue full, backing off");
                    thread::sleep(delay);
                    attempt += 1;
                    task = err.into_task();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Async variant of [`submit_with_retry`](Self::submit_with_retry);
    /// backs off with `tokio::time::sleep`.
    ///
    /// # Errors
    ///
    /// The last rejection once attempts are exhausted, or `PoolClosed`
    /// immediately.
    pub async fn submit_with_retry_async(
        &self,
        task: Task<P>,
        policy: &RetryPolicy,
    ) -> Result<TaskId, SubmitError<P>> {
        let mut task = task;
        let mut attempt = 1;
        loop {
            match self.try_submit(task) {
                Ok(id) => return Ok(id),
                Err(err) if err.is_queue_full() => {
                    let Some(delay) = policy.backoff(attempt) else {
                        return Err(err);
                    };
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    task = err.into_task();
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Change the number of workers while running.
    ///
    /// Growing spawns threads immediately. Shrinking asks idle workers to
    /// exit; busy workers finish their current task first.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for `0`, `PoolClosed` once draining, `Internal` if a
    /// thread could not be spawned.
    pub fn resize(&self, worker_count: usize) -> Result<(), PoolError> {
        if worker_count == 0 {
            return Err(PoolError::InvalidConfig("worker_count must be greater than 0".into()));
        }
        let mut lc = self.shared.lifecycle.lock();
        match lc.state {
            PoolState::Created => {
                lc.target_workers = worker_count;
                return Ok(());
            }
            PoolState::Running => {}
            PoolState::Draining | PoolState::Stopped => return Err(PoolError::PoolClosed),
        }

        // Retirements not yet picked up are withdrawn so the count below is
        // exact.
        let withdrawn = self.shared.retire_rx.try_iter().count();
        let live = lc.live_workers;

        info!(
            pool = %self.shared.name,
            from = live,
            to = worker_count,
            withdrawn,
            "resizing worker pool"
        );

        if live < worker_count {
            lc.grow_to(worker_count, |lc| self.shared.spawn_worker(lc))
        } else {
            lc.target_workers = worker_count;
            for _ in worker_count..live {
                let _ = self.shared.retire_tx.send(());
            }
            Ok(())
        }
    }

    /// Stop accepting tasks, wait up to `grace` for queued and running tasks
    /// to finish, then stop.
    ///
    /// If `grace` runs out, every remaining task is reported
    /// `Cancelled(ShutdownTimeout)` and the pool stops anyway; the call
    /// returns shortly after `grace`. A `Created` pool is started first so
    /// its queued tasks still run. A stopped pool returns an empty report.
    ///
    /// # Errors
    ///
    /// `Internal` if the workers of a `Created` pool could not be started;
    /// its queued tasks are then cancelled.
    pub fn shutdown(&self, grace: Duration) -> Result<ShutdownReport, PoolError> {
        let started = Instant::now();
        let deadline = started + grace;

        if self.state() == PoolState::Created {
            match self.start() {
                Ok(()) | Err(PoolError::AlreadyStarted) => {}
                Err(e) => {
                    error!(pool = %self.shared.name, error = %e, "could not start workers to drain");
                    let _ = self.cancel();
                    return Err(e);
                }
            }
        }

        {
            let mut lc = self.shared.lifecycle.lock();
            match lc.state {
                PoolState::Stopped => {
                    return Ok(ShutdownReport {
                        elapsed: started.elapsed(),
                        ..ShutdownReport::default()
                    });
                }
                PoolState::Running => self.shared.transition(&mut lc, PoolState::Draining),
                PoolState::Created | PoolState::Draining => {}
            }
        }

        info!(
            pool = %self.shared.name,
            grace_ms = grace.as_millis(),
            queued = self.shared.intake.len(),
            "Shutting down worker pool"
        );
        self.shared.intake.close();

        let mut report = self.shared.finish_draining(deadline, CancelReason::ShutdownTimeout);
        report.elapsed = started.elapsed();
        info!(
            pool = %self.shared.name,
            forced = report.forced,
            elapsed_ms = report.elapsed.as_millis(),
            "Worker pool shut down complete"
        );
        Ok(report)
    }

    /// [`shutdown`](Self::shutdown) with the configured grace period.
    ///
    /// # Errors
    ///
    /// See [`shutdown`](Self::shutdown).
    pub fn shutdown_graceful(&self) -> Result<ShutdownReport, PoolError> {
        self.shutdown(self.shared.config.shutdown_grace_period())
    }

    /// Cancel the pool.
    ///
    /// Queued tasks are reported `Cancelled(ExplicitCancel)` without
    /// running, and every running task's token fires. The configured
    /// [`InFlightPolicy`] decides the rest: `Finish` waits for the payloads
    /// to return, up to the configured grace period, and reports what they
    /// return; `Abort` drops them at once. Anything still running when the
    /// grace period ends is forced, also as `Cancelled(ExplicitCancel)`.
    /// Returns once the pool is stopped. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors [`shutdown`](Self::shutdown).
    pub fn cancel(&self) -> Result<ShutdownReport, PoolError> {
        let started = Instant::now();
        let never_started = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state == PoolState::Stopped {
                return Ok(ShutdownReport {
                    elapsed: started.elapsed(),
                    ..ShutdownReport::default()
                });
            }
            lc.abort_queued.get_or_insert(CancelReason::ExplicitCancel);
            let never_started = lc.state == PoolState::Created;
            self.shared.transition(&mut lc, PoolState::Draining);
            never_started
        };

        info!(pool = %self.shared.name, "Cancelling worker pool");
        self.shared.intake.close();
        let cancelled_queued = self.shared.cancel_queued(CancelReason::ExplicitCancel);

        if never_started {
            let mut lc = self.shared.lifecycle.lock();
            self.shared.transition(&mut lc, PoolState::Stopped);
            return Ok(ShutdownReport {
                cancelled_queued,
                elapsed: started.elapsed(),
                ..ShutdownReport::default()
            });
        }

        // Every running payload sees its token fire; `Finish` leaves the
        // payload in place to wind down and report on its own.
        self.shared.pool_token.cancel();
        let aborted_in_flight = match self.shared.config.in_flight_policy {
            InFlightPolicy::Finish => 0,
            InFlightPolicy::Abort => self.shared.abort_in_flight(CancelReason::ExplicitCancel),
        };

        let deadline = started + self.shared.config.shutdown_grace_period();
        let mut report = self.shared.finish_draining(deadline, CancelReason::ExplicitCancel);
        report.cancelled_queued += cancelled_queued;
        report.aborted_in_flight += aborted_in_flight;
        report.elapsed = started.elapsed();
        Ok(report)
    }

    fn enqueue(&self, mut task: Task<P>, block: bool) -> Result<TaskId, SubmitError<P>> {
        let shared = &self.shared;
        let (seq, deadline) = match shared.admit(&mut task) {
            Ok(admitted) => admitted,
            Err(error) => return Err(shared.reject(error, task)),
        };

        let task_id = task.id();
        let item = Queued {
            task,
            seq,
            deadline,
        };
        let sent = if block {
            shared.intake.send_blocking(item)
        } else {
            shared.intake.try_send(item)
        };

        match sent {
            Ok(()) => {
                shared.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
                shared.emit(Some(task_id), None, PoolEventKind::Accepted);
                debug!(pool = %shared.name, task_id = %task_id, seq, "Task submitted to worker pool");
                Ok(task_id)
            }
            Err((error, item)) => {
                shared.counters.dequeued(1);
                shared.sink.cancel_reservation(seq);
                Err(shared.reject(error, item.task))
            }
        }
    }
}

impl<P, R, E> Drop for WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn drop(&mut self) {
        // Cancel without joining. Running tasks are reported here so the
        // outcome stream ends even if a payload never returns; workers exit
        // on their own once it does.
        let no_workers = {
            let mut lc = self.shared.lifecycle.lock();
            if lc.state == PoolState::Stopped {
                return;
            }
            lc.abort_queued.get_or_insert(CancelReason::ExplicitCancel);
            self.shared.transition(&mut lc, PoolState::Draining);
            lc.live_workers == 0
        };

        self.shared.intake.close();
        self.shared.cancel_queued(CancelReason::ExplicitCancel);
        self.shared.pool_token.cancel();
        self.shared.abort_in_flight(CancelReason::ExplicitCancel);
        // Nobody may be consuming any more; producers must not block.
        self.shared.sink.close();

        if no_workers {
            let mut lc = self.shared.lifecycle.lock();
            self.shared.transition(&mut lc, PoolState::Stopped);
        }
        debug!(pool = %self.shared.name, "WorkerPool dropped without explicit shutdown - workers will be detached");
    }
}

impl<P, R, E> Shared<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    fn emit(&self, task_id: Option<TaskId>, worker: Option<usize>, kind: PoolEventKind) {
        if let Some(sink) = self.events.lock().as_mut() {
            sink.record(build_pool_event(&self.name, task_id, worker, kind));
        }
    }

    /// Move to `to`. Entering `Stopped` settles anything left in the intake
    /// and closes the outcome sink.
    fn transition(&self, lc: &mut Lifecycle, to: PoolState) {
        let from = lc.state;
        if from == to || from == PoolState::Stopped {
            return;
        }
        lc.state = to;
        info!(pool = %self.name, from = %from, to = %to, "pool state changed");
        if to == PoolState::Stopped {
            let reason = lc.abort_queued.unwrap_or(CancelReason::ShutdownTimeout);
            self.cancel_queued(reason);
            self.sink.close();
        }
        self.lifecycle_changed.notify_all();
        self.emit(None, None, PoolEventKind::StateChanged { from, to });
    }

    fn admit(&self, task: &mut Task<P>) -> Result<(u64, Option<Instant>), PoolError> {
        let mut lc = self.lifecycle.lock();
        if matches!(lc.state, PoolState::Draining | PoolState::Stopped) {
            return Err(PoolError::PoolClosed);
        }
        let seq = lc.next_seq;
        lc.next_seq += 1;
        self.sink.reserve();
        self.counters.queued_tasks.fetch_add(1, Ordering::AcqRel);
        Ok((seq, task.stamp(self.config.default_task_timeout())))
    }

    fn reject(&self, error: PoolError, task: Task<P>) -> SubmitError<P> {
        self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
        match error {
            PoolError::QueueFull => warn!(pool = %self.name, task_id = %task.id(), "Worker pool queue is full"),
            _ => debug!(pool = %self.name, task_id = %task.id(), error = %error, "submission rejected"),
        }
        self.emit(Some(task.id()), None, PoolEventKind::Rejected(error.to_string()));
        SubmitError::new(error, task)
    }

    /// Record and deliver a terminal outcome. `forced` outcomes come from
    /// the lifecycle controller and skip the sink's capacity bound.
    fn finish(&self, seq: u64, outcome: Outcome<R>, forced: bool) {
        let counter = match &outcome.kind {
            OutcomeKind::Succeeded(_) => &self.counters.completed_tasks,
            OutcomeKind::Failed(_) => &self.counters.failed_tasks,
            OutcomeKind::Cancelled(_) => &self.counters.cancelled_tasks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.emit(
            Some(outcome.task_id),
            outcome.worker,
            PoolEventKind::Finished(outcome_label(&outcome.kind)),
        );
        if forced {
            self.sink.deliver_forced(seq, outcome);
        } else {
            self.sink.deliver(seq, outcome);
        }
    }

    /// Report every queued task as cancelled.
    fn cancel_queued(&self, reason: CancelReason) -> usize {
        let drained = self.intake.drain();
        let count = drained.len();
        if count > 0 {
            self.counters.dequeued(count as u64);
            warn!(pool = %self.name, count, reason = %reason, "cancelling queued tasks");
        }
        for item in drained {
            self.finish(
                item.seq,
                Outcome::never_started(item.task.id(), reason, None),
                true,
            );
        }
        count
    }

    /// Claim every in-flight task, cancel its payload and report it.
    fn abort_in_flight(&self, reason: CancelReason) -> usize {
        let claimed: Vec<(u64, InFlight)> = self.lifecycle.lock().in_flight.drain().collect();
        let count = claimed.len();
        let now = Instant::now();
        for (seq, entry) in claimed {
            entry.token.cancel();
            entry.abort.cancel();
            warn!(
                pool = %self.name,
                worker_id = entry.worker,
                task_id = %entry.task_id,
                reason = %reason,
                "cancelling in-flight task"
            );
            self.finish(
                seq,
                Outcome {
                    task_id: entry.task_id,
                    kind: OutcomeKind::Cancelled(reason),
                    started_at: entry.started_at,
                    finished_at: now,
                    worker: Some(entry.worker),
                },
                true,
            );
        }
        count
    }

    /// Wait until `Stopped` or `deadline`; force the stop with `reason` if
    /// the deadline wins.
    fn finish_draining(&self, deadline: Instant, reason: CancelReason) -> ShutdownReport {
        if self.wait_for_stop(deadline) {
            self.join_workers();
            return ShutdownReport::default();
        }
        warn!(pool = %self.name, reason = %reason, "grace period elapsed, cancelling remaining work");
        self.force_stop(reason)
    }

    fn wait_for_stop(&self, deadline: Instant) -> bool {
        let mut lc = self.lifecycle.lock();
        while lc.state != PoolState::Stopped {
            if self.lifecycle_changed.wait_until(&mut lc, deadline).timed_out() {
                return lc.state == PoolState::Stopped;
            }
        }
        true
    }

    /// Settle everything left with `reason`, unless a cancel already
    /// recorded its own.
    fn force_stop(&self, reason: CancelReason) -> ShutdownReport {
        let reason = *self.lifecycle.lock().abort_queued.get_or_insert(reason);
        self.pool_token.cancel();
        let cancelled_queued = self.cancel_queued(reason);
        let aborted_in_flight = self.abort_in_flight(reason);
        // Workers blocked on a full outcome buffer must be able to leave.
        self.sink.close();

        let exit_deadline = Instant::now() + FORCED_EXIT_WAIT;
        let stuck = {
            let mut lc = self.lifecycle.lock();
            while lc.live_workers > 0 {
                if self.lifecycle_changed.wait_until(&mut lc, exit_deadline).timed_out() {
                    break;
                }
            }
            self.transition(&mut lc, PoolState::Stopped);
            lc.live_workers
        };

        if stuck == 0 {
            self.join_workers();
        } else {
            self.reap_finished_workers();
            warn!(
                pool = %self.name,
                detached = stuck,
                "Workers did not exit within timeout - detaching"
            );
        }

        ShutdownReport {
            forced: true,
            cancelled_queued,
            aborted_in_flight,
            detached_workers: stuck,
            elapsed: Duration::ZERO,
        }
    }

    /// Join every worker thread. Only called once all of them have left
    /// their loop.
    fn join_workers(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for (idx, handle) in handles.into_iter().enumerate() {
            if handle.join().is_err() {
                warn!(pool = %self.name, worker_id = idx, "Worker panicked");
            }
        }
    }

    /// Join exited threads and drop (detach) the rest.
    fn reap_finished_workers(&self) {
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.is_finished() && handle.join().is_err() {
                warn!(pool = %self.name, "Worker panicked");
            }
        }
    }

    fn spawn_worker(self: &Arc<Self>, lc: &mut Lifecycle) -> Result<(), PoolError> {
        let worker_id = lc.next_worker_id;
        lc.next_worker_id += 1;

        let shared = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("{}-worker-{worker_id}", self.name))
            .stack_size(self.config.thread_stack_size)
            .spawn(move || shared.worker_main(worker_id))
            .map_err(|e| {
                error!(pool = %self.name, worker_id, error = %e, "Failed to spawn worker thread");
                PoolError::Internal(format!("failed to spawn worker thread: {e}"))
            })?;

        lc.live_workers += 1;
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        Ok(())
    }

    fn worker_main(self: Arc<Self>, worker_id: usize) {
        debug!(pool = %self.name, worker_id, "Worker thread started");

        let exit = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => self.worker_loop(worker_id, &rt),
            Err(e) => {
                error!(pool = %self.name, worker_id, error = %e, "Failed to create worker runtime");
                WorkerExit::RuntimeFailed
            }
        };

        self.on_worker_exit(worker_id, exit);
    }

    fn worker_loop(&self, worker_id: usize, rt: &tokio::runtime::Runtime) -> WorkerExit {
        let task_rx = self.intake.receiver();
        loop {
            // A pending retirement wins over more work.
            if self.retire_rx.try_recv().is_ok() {
                return WorkerExit::Retired;
            }

            let mut sel = Select::new();
            let task_idx = sel.recv(&task_rx);
            sel.recv(&self.retire_rx);
            let oper = sel.select();

            if oper.index() == task_idx {
                match oper.recv(&task_rx) {
                    Ok(item) => self.run_task(worker_id, item, rt),
                    Err(_) => {
                        debug!(pool = %self.name, worker_id, "Worker channel closed, exiting");
                        return WorkerExit::Drained;
                    }
                }
            } else if oper.recv(&self.retire_rx).is_ok() {
                return WorkerExit::Retired;
            }
        }
    }

    fn on_worker_exit(self: &Arc<Self>, worker_id: usize, exit: WorkerExit) {
        let mut lc = self.lifecycle.lock();
        lc.live_workers -= 1;
        debug!(
            pool = %self.name,
            worker_id,
            exit = ?exit,
            live_workers = lc.live_workers,
            "Worker thread exiting"
        );

        match lc.state {
            PoolState::Running if exit == WorkerExit::Retired => {
                // A resize raced with this retirement; top the pool back up.
                while lc.live_workers < lc.target_workers {
                    if self.spawn_worker(&mut lc).is_err() {
                        break;
                    }
                }
            }
            PoolState::Draining if lc.live_workers == 0 => {
                self.transition(&mut lc, PoolState::Stopped);
            }
            _ => {}
        }
        self.lifecycle_changed.notify_all();
    }

    fn run_task(&self, worker_id: usize, item: Queued<P>, rt: &tokio::runtime::Runtime) {
        let Queued {
            task,
            seq,
            deadline,
        } = item;
        self.counters.dequeued(1);
        let (payload, meta) = task.into_parts(deadline);
        let task_id = meta.id;
        let started_at = Instant::now();

        let admitted = {
            let mut lc = self.lifecycle.lock();
            let skip = lc.abort_queued.or_else(|| {
                meta.is_expired_at(started_at)
                    .then_some(CancelReason::DeadlineExceeded)
            });
            match skip {
                Some(reason) => Err(reason),
                None => {
                    let token = self.pool_token.child_token();
                    let abort = CancellationToken::new();
                    lc.in_flight.insert(
                        seq,
                        InFlight {
                            task_id,
                            worker: worker_id,
                            started_at,
                            token: token.clone(),
                            abort: abort.clone(),
                        },
                    );
                    Ok((token, abort))
                }
            }
        };

        let (token, abort) = match admitted {
            Ok(tokens) => tokens,
            Err(reason) => {
                debug!(pool = %self.name, worker_id, task_id = %task_id, reason = %reason, "Task cancelled before start");
                self.finish(seq, Outcome::never_started(task_id, reason, Some(worker_id)), false);
                return;
            }
        };

        self.counters.task_started();
        self.emit(Some(task_id), Some(worker_id), PoolEventKind::Started);
        debug!(pool = %self.name, worker_id, task_id = %task_id, "Worker executing task");

        let ctx = TaskContext::new(meta, worker_id, token.clone());
        let run = rt.block_on(run_guarded(&self.executor, payload, ctx, deadline, &token, &abort));
        self.counters.task_stopped();

        let claimed = self.lifecycle.lock().in_flight.remove(&seq);
        if claimed.is_none() {
            debug!(pool = %self.name, worker_id, task_id = %task_id, "Outcome already reported by controller, discarding result");
            return;
        }

        let kind = match run {
            GuardedRun::Finished(Ok(value)) => OutcomeKind::Succeeded(value),
            GuardedRun::Finished(Err(err)) if token.is_cancelled() => {
                let reason = if self.pool_token.is_cancelled() {
                    self.lifecycle
                        .lock()
                        .abort_queued
                        .unwrap_or(CancelReason::ExplicitCancel)
                } else {
                    CancelReason::DeadlineExceeded
                };
                debug!(pool = %self.name, task_id = %task_id, error = %err, reason = %reason, "Payload stopped after cancellation");
                OutcomeKind::Cancelled(reason)
            }
            GuardedRun::Finished(Err(err)) => OutcomeKind::Failed(PayloadError::Returned(err)),
            GuardedRun::Panicked(message) => {
                warn!(pool = %self.name, worker_id, task_id = %task_id, panic = %message, "Task panicked");
                OutcomeKind::Failed(PayloadError::Panicked(message))
            }
            GuardedRun::Aborted => OutcomeKind::Cancelled(CancelReason::ExplicitCancel),
        };

        debug!(pool = %self.name, worker_id, task_id = %task_id, "Worker completed task");
        self.finish(
            seq,
            Outcome {
                task_id,
                kind,
                started_at,
                finished_at: Instant::now(),
                worker: Some(worker_id),
            },
            false,
        );
    }
}

enum GuardedRun<R> {
    Finished(anyhow::Result<R>),
    Panicked(String),
    Aborted,
}

/// Drive one payload, firing its token at the deadline and dropping it if
/// the controller aborts it.
async fn run_guarded<P, R, E>(
    executor: &E,
    payload: P,
    ctx: TaskContext,
    deadline: Option<Instant>,
    token: &CancellationToken,
    abort: &CancellationToken,
) -> GuardedRun<R>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    let execution = AssertUnwindSafe(executor.execute(payload, ctx)).catch_unwind();
    tokio::pin!(execution);

    let expiry = async move {
        match deadline {
            Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expiry);
    let mut expired = false;

    loop {
        tokio::select! {
            biased;
            () = abort.cancelled() => return GuardedRun::Aborted,
            result = &mut execution => {
                return match result {
                    Ok(result) => GuardedRun::Finished(result),
                    Err(panic) => GuardedRun::Panicked(panic_message(panic.as_ref())),
                };
            }
            () = &mut expiry, if !expired => {
                expired = true;
                token.cancel();
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

fn outcome_label<R>(kind: &OutcomeKind<R>) -> String {
    match kind {
        OutcomeKind::Succeeded(_) => "succeeded".to_string(),
        OutcomeKind::Failed(_) => "failed".to_string(),
        OutcomeKind::Cancelled(reason) => format!("cancelled: {reason}"),
    }
}

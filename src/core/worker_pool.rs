//! Worker pool with dedicated worker threads.
//!
//! `WorkerPool` owns an intake queue, a set of OS worker threads (each with
//! its own single-threaded tokio runtime) and an outcome sink. Every
//! accepted task produces exactly one [`Outcome`](super::Outcome), including
//! tasks cancelled by deadlines, by `cancel`, or by a shutdown that ran out
//! of grace period.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskcore::config::WorkerPoolConfig;
//! use taskcore::core::{executor_fn, Task, WorkerPool};
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new().with_worker_count(4).with_queue_capacity(64),
//!     executor_fn(|n: u64, _ctx| async move { Ok(n * 2) }),
//! )?;
//! pool.start()?;
//!
//! let outcomes = pool.outcomes();
//! pool.submit(Task::new(21))?;
//! pool.shutdown(Duration::from_secs(5))?;
//!
//! for outcome in outcomes {
//!     println!("{}: {:?}", outcome.task_id, outcome.kind);
//! }
//! ```

mod native;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use native::WorkerPool;

/// Lifecycle state of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Constructed; tasks may be queued but no worker runs yet.
    Created,
    /// Workers are running and new tasks are accepted.
    Running,
    /// New tasks are refused; queued and running tasks are being finished.
    Draining,
    /// Terminal. No workers, no intake.
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What a `shutdown` or `cancel` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The grace period ran out and remaining work was cancelled.
    pub forced: bool,
    /// Queued tasks reported as cancelled without running.
    pub cancelled_queued: usize,
    /// Running tasks reported as cancelled.
    pub aborted_in_flight: usize,
    /// Worker threads still stuck in a payload that never yielded; they were
    /// detached and exit once the payload returns.
    pub detached_workers: usize,
    /// Wall time spent in the call.
    pub elapsed: Duration,
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Configured (target) number of workers.
    pub worker_count: usize,
    /// Worker threads currently alive, including ones retiring.
    pub live_workers: usize,
    /// Currently executing tasks.
    pub active_tasks: u64,
    /// Highest number of simultaneously executing tasks seen.
    pub peak_active_tasks: u64,
    /// Tasks waiting in the intake queue.
    pub queued_tasks: u64,
    /// Total tasks accepted.
    pub submitted_tasks: u64,
    /// Total submissions rejected (full or closed).
    pub rejected_tasks: u64,
    /// Tasks whose payload returned a value.
    pub completed_tasks: u64,
    /// Tasks whose payload returned an error or panicked.
    pub failed_tasks: u64,
    /// Tasks that ended cancelled.
    pub cancelled_tasks: u64,
    /// Outcomes produced but not yet received by a consumer.
    pub buffered_outcomes: usize,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub peak_active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
    pub rejected_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub failed_tasks: AtomicU64,
    pub cancelled_tasks: AtomicU64,
}

impl PoolCounters {
    /// Mark a task as started and track the peak.
    pub fn task_started(&self) {
        let now = self.active_tasks.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active_tasks.fetch_max(now, Ordering::AcqRel);
    }

    pub fn task_stopped(&self) {
        self.active_tasks.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn dequeued(&self, n: u64) {
        self.queued_tasks.fetch_sub(n, Ordering::AcqRel);
    }

    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize, live_workers: usize, buffered: usize) -> PoolStats {
        PoolStats {
            worker_count,
            live_workers,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            peak_active_tasks: self.peak_active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            cancelled_tasks: self.cancelled_tasks.load(Ordering::Relaxed),
            buffered_outcomes: buffered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_state_display() {
        assert_eq!(PoolState::Draining.to_string(), "draining");
        assert_eq!(
            serde_json::to_string(&PoolState::Stopped).unwrap(),
            "\"stopped\""
        );
    }

    #[test]
    fn test_pool_stats_default() {
        let stats = PoolStats::default();
        assert_eq!(stats.worker_count, 0);
        assert_eq!(stats.active_tasks, 0);
        assert_eq!(stats.completed_tasks, 0);
    }

    #[test]
    fn test_pool_counters_peak() {
        let counters = PoolCounters::default();
        counters.task_started();
        counters.task_started();
        counters.task_stopped();
        counters.task_started();
        counters.submitted_tasks.fetch_add(10, Ordering::Relaxed);

        let stats = counters.snapshot(4, 4, 2);
        assert_eq!(stats.worker_count, 4);
        assert_eq!(stats.active_tasks, 2);
        assert_eq!(stats.peak_active_tasks, 2);
        assert_eq!(stats.submitted_tasks, 10);
        assert_eq!(stats.buffered_outcomes, 2);
    }
}

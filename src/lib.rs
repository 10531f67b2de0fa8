//! # taskcore
//!
//! A bounded, concurrent task-execution core.
//!
//! Producers submit typed tasks into a bounded intake queue; a pool of worker
//! threads executes them under per-task deadlines; every accepted task ends
//! in exactly one [`Outcome`](core::Outcome) delivered through a bounded
//! outcome stream; a lifecycle controller starts, drains, cancels and stops
//! the pool without leaking threads or losing outcomes.
//!
//! ## Key Features
//!
//! - **Backpressure**: blocking [`submit`](core::WorkerPool::submit), non-blocking
//!   [`try_submit`](core::WorkerPool::try_submit), and a capacity-0 rendezvous mode
//! - **Dedicated threads**: each worker owns a single-threaded tokio runtime, so
//!   CPU-bound payloads never stall the caller's runtime
//! - **Deadlines**: expired tasks are never started; running tasks are told to
//!   stop through a cancellation token
//! - **Bounded shutdown**: `shutdown(grace)` returns shortly after `grace`, reporting
//!   every unfinished task as cancelled
//! - **Elastic sizing**: [`resize`](core::WorkerPool::resize) while running
//! - **Ordered or unordered outcomes**, configurable per pool
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use taskcore::config::WorkerPoolConfig;
//! use taskcore::core::{executor_fn, Task, WorkerPool};
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new()
//!         .with_worker_count(4)
//!         .with_queue_capacity(128)
//!         .with_default_task_timeout(Duration::from_secs(30)),
//!     executor_fn(|line: String, _ctx| async move { Ok(line.len()) }),
//! )?;
//! pool.start()?;
//!
//! let outcomes = pool.outcomes();
//! for line in lines {
//!     pool.submit(Task::new(line))?;
//! }
//! let report = pool.shutdown(Duration::from_secs(10))?;
//! let total: usize = outcomes.filter_map(|o| o.into_result().ok()).sum();
//! ```
//!
//! See `tests/` for lifecycle, backpressure and cancellation scenarios.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Task model, intake, worker pool and outcome delivery.
pub mod core;
/// Configuration models for worker pools.
pub mod config;
/// Builders to construct pools from configuration.
pub mod builders;
/// Shared utilities.
pub mod util;

//! Worker pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Prefix for environment variables read by [`WorkerPoolConfig::from_env`].
pub const ENV_PREFIX: &str = "TASKCORE_";

const DEFAULT_QUEUE_CAPACITY: usize = 1024;
const DEFAULT_OUTCOME_CAPACITY: usize = 1024;
const DEFAULT_GRACE_MS: u64 = 30_000;
const DEFAULT_STACK_SIZE: usize = 2 * 1024 * 1024;

/// Delivery order of the outcome stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeOrdering {
    /// Outcomes are delivered as soon as they are produced.
    #[default]
    Unordered,
    /// Outcomes are delivered in the order their tasks were accepted.
    Submission,
}

/// What a pool-level cancel does to tasks that are already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Fire the running tasks' tokens and let the payloads return on their
    /// own, up to the grace period; only queued tasks are dropped unrun.
    #[default]
    Finish,
    /// Cancel running tasks immediately and report them as cancelled.
    Abort,
}

/// Configuration accepted by [`crate::core::WorkerPool::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Intake queue capacity. `0` means direct hand-off to an idle worker.
    pub queue_capacity: usize,
    /// Timeout applied to tasks submitted without an explicit deadline.
    pub default_task_timeout_ms: Option<u64>,
    /// Grace period used by `shutdown_graceful` and by `cancel` under
    /// [`InFlightPolicy::Finish`].
    pub shutdown_grace_period_ms: u64,
    /// Number of undelivered outcomes buffered before workers block.
    pub outcome_capacity: usize,
    /// Outcome delivery order.
    pub ordering: OutcomeOrdering,
    /// Handling of running tasks on `cancel`.
    pub in_flight_policy: InFlightPolicy,
    /// Stack size for worker threads, in bytes.
    pub thread_stack_size: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_task_timeout_ms: None,
            shutdown_grace_period_ms: DEFAULT_GRACE_MS,
            outcome_capacity: DEFAULT_OUTCOME_CAPACITY,
            ordering: OutcomeOrdering::default(),
            in_flight_policy: InFlightPolicy::default(),
            thread_stack_size: DEFAULT_STACK_SIZE,
        }
    }
}

impl WorkerPoolConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    /// Set the intake queue capacity (`0` for direct hand-off).
    #[must_use]
    pub const fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the timeout applied to tasks without an explicit deadline.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_default_task_timeout(mut self, timeout: Duration) -> Self {
        self.default_task_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set the shutdown grace period.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period_ms = grace.as_millis() as u64;
        self
    }

    /// Set the outcome buffer capacity.
    #[must_use]
    pub const fn with_outcome_capacity(mut self, outcome_capacity: usize) -> Self {
        self.outcome_capacity = outcome_capacity;
        self
    }

    /// Set the outcome delivery order.
    #[must_use]
    pub const fn with_ordering(mut self, ordering: OutcomeOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Set the in-flight cancellation policy.
    #[must_use]
    pub const fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight_policy = policy;
        self
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Default task timeout as a `Duration`.
    #[must_use]
    pub const fn default_task_timeout(&self) -> Option<Duration> {
        match self.default_task_timeout_ms {
            Some(ms) => Some(Duration::from_millis(ms)),
            None => None,
        }
    }

    /// Shutdown grace period as a `Duration`.
    #[must_use]
    pub const fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.outcome_capacity == 0 {
            return Err("outcome_capacity must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        if self.default_task_timeout_ms == Some(0) {
            return Err("default_task_timeout_ms must be greater than 0 when set".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// Missing fields take their default values.
    ///
    /// # Errors
    ///
    /// Returns a description of the parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from `TASKCORE_*` environment variables, loading a
    /// `.env` file first if one exists.
    ///
    /// Recognised keys: `WORKER_COUNT`, `QUEUE_CAPACITY`,
    /// `DEFAULT_TASK_TIMEOUT_MS`, `SHUTDOWN_GRACE_PERIOD_MS`,
    /// `OUTCOME_CAPACITY`, `ORDERING`, `IN_FLIGHT_POLICY`,
    /// `THREAD_STACK_SIZE`. Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a description of the first unparsable value or validation
    /// failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(format!("{ENV_PREFIX}{key}")).ok())
    }

    /// Build configuration from an arbitrary key lookup (keys without prefix).
    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, String>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| format!("{ENV_PREFIX}{key}: {e}"))
        }

        fn parse_enum<T: for<'de> Deserialize<'de>>(key: &str, raw: &str) -> Result<T, String> {
            serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
                .map_err(|e| format!("{ENV_PREFIX}{key}: {e}"))
        }

        let mut cfg = Self::default();
        if let Some(v) = lookup("WORKER_COUNT") {
            cfg.worker_count = parse("WORKER_COUNT", &v)?;
        }
        if let Some(v) = lookup("QUEUE_CAPACITY") {
            cfg.queue_capacity = parse("QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("DEFAULT_TASK_TIMEOUT_MS") {
            cfg.default_task_timeout_ms = Some(parse("DEFAULT_TASK_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("SHUTDOWN_GRACE_PERIOD_MS") {
            cfg.shutdown_grace_period_ms = parse("SHUTDOWN_GRACE_PERIOD_MS", &v)?;
        }
        if let Some(v) = lookup("OUTCOME_CAPACITY") {
            cfg.outcome_capacity = parse("OUTCOME_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("ORDERING") {
            cfg.ordering = parse_enum("ORDERING", &v)?;
        }
        if let Some(v) = lookup("IN_FLIGHT_POLICY") {
            cfg.in_flight_policy = parse_enum("IN_FLIGHT_POLICY", &v)?;
        }
        if let Some(v) = lookup("THREAD_STACK_SIZE") {
            cfg.thread_stack_size = parse("THREAD_STACK_SIZE", &v)?;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

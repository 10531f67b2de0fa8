//! Builder assembling a [`WorkerPool`] from configuration, an executor and
//! optional event sink.

use crate::config::WorkerPoolConfig;
use crate::core::{EventSink, PoolError, WorkerExecutor, WorkerPool};

/// Step-by-step construction of a [`WorkerPool`].
///
/// ```rust,ignore
/// let pool = PoolBuilder::new(executor_fn(|n: u64, _ctx| async move { Ok(n + 1) }))
///     .name("ingest")
///     .config(WorkerPoolConfig::from_env()?)
///     .build_started()?;
/// ```
pub struct PoolBuilder<E> {
    name: Option<String>,
    config: WorkerPoolConfig,
    executor: E,
    events: Option<Box<dyn EventSink>>,
}

impl<E> PoolBuilder<E> {
    /// Start from the default configuration.
    pub fn new(executor: E) -> Self {
        Self {
            name: None,
            config: WorkerPoolConfig::default(),
            executor,
            events: None,
        }
    }

    /// Pool name, used in thread names and log fields.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: WorkerPoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Adjust the configuration in place.
    #[must_use]
    pub fn configure(mut self, f: impl FnOnce(WorkerPoolConfig) -> WorkerPoolConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Install an event sink on the built pool.
    #[must_use]
    pub fn event_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    /// Validate and build a pool in the `Created` state.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if the configuration is invalid.
    pub fn build<P, R>(self) -> Result<WorkerPool<P, R, E>, PoolError>
    where
        P: Send + 'static,
        R: Send + 'static,
        E: WorkerExecutor<P, R>,
    {
        let pool = match self.name {
            Some(name) => WorkerPool::named(name, self.config, self.executor)?,
            None => WorkerPool::new(self.config, self.executor)?,
        };
        if let Some(sink) = self.events {
            pool.set_event_sink(sink);
        }
        Ok(pool)
    }

    /// Build and start the pool.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` for a bad configuration, `Internal` if no worker
    /// thread could be spawned.
    pub fn build_started<P, R>(self) -> Result<WorkerPool<P, R, E>, PoolError>
    where
        P: Send + 'static,
        R: Send + 'static,
        E: WorkerExecutor<P, R>,
    {
        let pool = self.build()?;
        pool.start()?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{executor_fn, InMemoryEventSink, PoolState, Task};
    use std::time::Duration;

    #[test]
    fn test_builder_applies_name_and_config() {
        let pool = PoolBuilder::new(executor_fn(|n: u32, _ctx| async move { Ok(n) }))
            .name("builder-test")
            .configure(|c| c.with_worker_count(2).with_queue_capacity(3))
            .build()
            .unwrap();
        assert_eq!(pool.name(), "builder-test");
        assert_eq!(pool.config().worker_count, 2);
        assert_eq!(pool.state(), PoolState::Created);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = PoolBuilder::new(executor_fn(|n: u32, _ctx| async move { Ok(n) }))
            .configure(|c| c.with_worker_count(0))
            .build();
        assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn test_build_started_runs_tasks() {
        let pool = PoolBuilder::new(executor_fn(|n: u32, _ctx| async move { Ok(n + 1) }))
            .configure(|c| c.with_worker_count(1))
            .event_sink(Box::new(InMemoryEventSink::new(16)))
            .build_started()
            .unwrap();
        assert_eq!(pool.state(), PoolState::Running);

        let outcomes = pool.outcomes();
        pool.submit(Task::new(1)).unwrap();
        pool.shutdown(Duration::from_secs(5)).unwrap();
        let values: Vec<u32> = outcomes.filter_map(|o| o.into_result().ok()).collect();
        assert_eq!(values, vec![2]);
    }
}

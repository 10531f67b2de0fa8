//! Configuration models for worker pools.

pub mod pool;

pub use pool::{InFlightPolicy, OutcomeOrdering, WorkerPoolConfig, ENV_PREFIX};

//! Task model, intake, worker pool and outcome delivery.

pub mod audit;
pub mod error;
pub mod executor;
pub(crate) mod intake;
pub mod retry;
pub mod sink;
pub mod task;
pub mod worker_pool;

pub use audit::{build_pool_event, EventSink, InMemoryEventSink, PoolEvent, PoolEventKind, TracingEventSink};
pub use error::{AppResult, CancelReason, PayloadError, PoolError, SubmitError};
pub use executor::{executor_fn, FnExecutor, TaskContext, WorkerExecutor};
pub use retry::RetryPolicy;
pub use sink::{OutcomeRecvError, Outcomes};
pub use task::{Outcome, OutcomeKind, Task, TaskId, TaskMetadata};
pub use worker_pool::{PoolState, PoolStats, ShutdownReport, WorkerPool};

//! Task execution trait and the context handed to payloads.

use std::future::Future;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::task::TaskMetadata;

/// Per-execution context passed to [`WorkerExecutor::execute`].
///
/// Payloads are expected to watch [`TaskContext::cancelled`] at safe points;
/// the pool fires it when the task deadline elapses or the pool is shutting
/// down. A payload that ignores it keeps its worker busy until it returns.
#[derive(Debug, Clone)]
pub struct TaskContext {
    meta: TaskMetadata,
    worker_id: usize,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) const fn new(meta: TaskMetadata, worker_id: usize, token: CancellationToken) -> Self {
        Self {
            meta,
            worker_id,
            token,
        }
    }

    /// Metadata of the running task.
    #[must_use]
    pub const fn meta(&self) -> &TaskMetadata {
        &self.meta
    }

    /// Slot index of the executing worker.
    #[must_use]
    pub const fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// True once cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// A clone of the underlying token, for handing to nested work.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Executes task payloads of type `P`, producing results of type `R`.
///
/// One clone of the executor lives on each worker thread, and `execute` runs
/// on that worker's single-threaded tokio runtime, so CPU-bound work here
/// does not stall the caller's runtime.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use taskcore::core::{TaskContext, WorkerExecutor};
///
/// #[derive(Clone)]
/// struct Resize;
///
/// #[async_trait]
/// impl WorkerExecutor<Image, Thumbnail> for Resize {
///     async fn execute(&self, image: Image, ctx: TaskContext) -> anyhow::Result<Thumbnail> {
///         for row in image.rows() {
///             if ctx.is_cancelled() {
///                 anyhow::bail!("cancelled");
///             }
///             // ...
///         }
///         Ok(thumb)
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Run one payload to completion.
    ///
    /// Errors are delivered verbatim inside the task outcome; panics are
    /// caught by the worker and reported as failures.
    async fn execute(&self, payload: P, ctx: TaskContext) -> anyhow::Result<R>;
}

/// Adapter turning an async closure into a [`WorkerExecutor`].
#[derive(Clone)]
pub struct FnExecutor<F>(F);

/// Wrap `f` as an executor.
///
/// ```rust,ignore
/// let exec = executor_fn(|n: u64, _ctx| async move { Ok(n * 2) });
/// ```
pub const fn executor_fn<P, R, F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(P, TaskContext) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    FnExecutor(f)
}

#[async_trait]
impl<P, R, F, Fut> WorkerExecutor<P, R> for FnExecutor<F>
where
    P: Send + 'static,
    R: Send + 'static,
    F: Fn(P, TaskContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn execute(&self, payload: P, ctx: TaskContext) -> anyhow::Result<R> {
        (self.0)(payload, ctx).await
    }
}

//! Task handler trait, the per-invocation context, and the runtime spawn seam.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AppResult;
use crate::util::serde::TaskId;

/// Abstraction for the business logic of a task.
///
/// The handler receives a [`TaskContext`] and returns a JSON result or an
/// error. Errors and timeouts are handed to the retry policy; the engine never
/// propagates them to the submitter.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_task_engine::core::{AppResult, TaskContext, TaskHandler};
///
/// struct Summarize;
///
/// #[async_trait]
/// impl TaskHandler for Summarize {
///     async fn run(&self, ctx: TaskContext) -> AppResult<serde_json::Value> {
///         ctx.report_progress(50.0);
///         Ok(serde_json::json!({ "summary": "..." }))
///     }
/// }
/// ```
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Run one attempt of the task.
    ///
    /// Long-running handlers should watch [`TaskContext::cancelled`]; the
    /// scheduler does not interrupt a handler that ignores it.
    async fn run(&self, ctx: TaskContext) -> AppResult<Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<Value>> + Send + 'static,
{
    async fn run(&self, ctx: TaskContext) -> AppResult<Value> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a shareable handler.
///
/// ```rust,ignore
/// let handler = handler_fn(|_ctx| async { Ok(serde_json::json!(42)) });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult<Value>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Callbacks a running handler uses to talk back to the scheduler.
pub(crate) trait TaskReporter: Send + Sync {
    fn progress(&self, task_id: TaskId, execution: u64, progress: f64);
    fn emit(&self, task_id: TaskId, execution: u64, name: String, payload: Value);
}

/// Everything a handler receives for one attempt.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    attempt: u32,
    execution: u64,
    cancellation: CancellationToken,
    dependency_results: Arc<HashMap<TaskId, Value>>,
    reporter: Arc<dyn TaskReporter>,
}

impl TaskContext {
    pub(crate) fn new(
        task_id: TaskId,
        attempt: u32,
        execution: u64,
        cancellation: CancellationToken,
        dependency_results: HashMap<TaskId, Value>,
        reporter: Arc<dyn TaskReporter>,
    ) -> Self {
        Self {
            task_id,
            attempt,
            execution,
            cancellation,
            dependency_results: Arc::new(dependency_results),
            reporter,
        }
    }

    /// Identity of the task being run.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Zero for the first attempt, then the retry number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Token cancelled when the task is cancelled or times out.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    /// Report progress (clamped to 0–100). Ignored once the attempt is over.
    pub fn report_progress(&self, progress: f64) {
        self.reporter
            .progress(self.task_id, self.execution, progress.clamp(0.0, 100.0));
    }

    /// Publish a custom `task:event` scoped to this task.
    pub fn emit(&self, name: impl Into<String>, payload: Value) {
        self.reporter
            .emit(self.task_id, self.execution, name.into(), payload);
    }

    /// Result of a completed prerequisite.
    #[must_use]
    pub fn dependency_result(&self, id: &TaskId) -> Option<&Value> {
        self.dependency_results.get(id)
    }

    /// Results of all prerequisites, keyed by task id.
    #[must_use]
    pub fn dependency_results(&self) -> &HashMap<TaskId, Value> {
        &self.dependency_results
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("attempt", &self.attempt)
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Abstraction for spawning task execution on a runtime.
pub trait Spawn {
    /// Spawn an async task that returns a future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

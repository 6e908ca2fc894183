use std::future::Future;

use async_trait::async_trait;

use super::context::TaskContext;
use crate::domain::{HandlerError, Task};

/// The unit of work behind one task type.
///
/// A handler receives a snapshot of the claimed record and a [`TaskContext`]
/// for progress, logs and cancellation. The returned value becomes the task's
/// `result`. Errors are classified by the retry policy; they never reach API
/// callers.
///
/// Handlers should await `ctx` calls or other I/O regularly: cancellation
/// takes effect at the next suspension point.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: Task, ctx: TaskContext) -> Result<serde_json::Value, HandlerError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`TaskHandler`].
///
/// ```ignore
/// let echo = handler_fn(|task: Task, _ctx| async move {
///     Ok(serde_json::json!({ "command": task.command }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task, TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send,
{
    async fn run(&self, task: Task, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        (self.0)(task, ctx).await
    }
}

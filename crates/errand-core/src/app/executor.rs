//! Executor - runs one claimed task and records its outcome.
//!
//! State transitions owned here (all guarded by `expect_status = Running`):
//! - Running -> Completed: handler returned a value
//! - Running -> Pending: retryable failure with budget left, or shutdown
//! - Running -> Failed: fatal failure or exhausted budget
//!
//! Running -> Cancelled is written by the cancellation controller; the
//! executor only aborts the handler when told to.
//!
//! While the store is unavailable the final write is held and retried with
//! backoff, and the task keeps its dispatcher slot. Only shutdown gives up
//! on it, leaving the record Running for start-up recovery.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::retry::{RetryDecision, RetryPolicy};

/// Upper bound for the pause between held final writes.
const MAX_WRITE_BACKOFF: Duration = Duration::from_secs(30);
use crate::domain::{HandlerError, StorageError, Task, TaskId, TaskPatch, TaskStatus, log_line};
use crate::handler::{HandlerRegistry, Signal, TaskContext};
use crate::ports::{Clock, StorageRetry, TaskStore, with_storage_retry};

/// How one execution ended, from the executor's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Requeued { attempt: u32 },
    Failed,
    Cancelled,
    /// Returned to Pending by shutdown; retry budget untouched.
    Interrupted,
    /// The record changed under us (cancelled or deleted); nothing written.
    Superseded,
    /// The final write could not be stored: shutdown came during a store
    /// outage, or the store refused it for good. The record stays Running.
    StorageFailed,
}

enum Run {
    Finished(Result<serde_json::Value, HandlerError>),
    Interrupted(Signal),
}

pub struct Executor {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    storage_retry: StorageRetry,
}

impl Executor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            policy: RetryPolicy::default(),
            timeout: None,
            storage_retry: StorageRetry::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_storage_retry(mut self, retry: StorageRetry) -> Self {
        self.storage_retry = retry;
        self
    }

    /// Run a task that has already been claimed (status Running).
    pub async fn execute(&self, task: Task, signal: watch::Receiver<Signal>) -> ExecutionOutcome {
        let span = info_span!("task", task_id = %task.id, task_type = %task.task_type);
        self.execute_inner(task, signal).instrument(span).await
    }

    async fn execute_inner(
        &self,
        task: Task,
        mut signal: watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        let Some(handler) = self.registry.get(task.task_type) else {
            let reason = format!(
                "configuration error: no handler registered for type {}",
                task.task_type
            );
            error!(%reason, "cannot execute task");
            return self.fail(&task, reason, &signal).await;
        };

        let attempt = task.retry_count + 1;
        let started = TaskPatch::new().log(log_line(
            self.clock.now(),
            &format!("Started (attempt {attempt}/{})", task.max_retries + 1),
        ));
        if let Err(outcome) = self.write(task.id, started, &signal).await {
            return outcome;
        }
        info!(attempt, priority = task.priority, "task started");

        let ctx = TaskContext::new(
            task.id,
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            signal.clone(),
        );
        let snapshot = task.clone();
        let mut join = tokio::spawn(
            async move { handler.run(snapshot, ctx).await }.in_current_span(),
        );

        let timeout = self.timeout;
        let deadline = async move {
            match timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let run = tokio::select! {
            biased;
            interrupt = interrupted(&mut signal) => Run::Interrupted(interrupt),
            joined = &mut join => Run::Finished(match joined {
                Ok(result) => result,
                Err(err) if err.is_panic() => Err(HandlerError::permanent(format!(
                    "handler panicked: {}",
                    panic_message(err.into_panic())
                ))),
                Err(_) => Err(HandlerError::Cancelled),
            }),
            limit = deadline => Run::Finished(Err(HandlerError::TimedOut(limit))),
        };
        if !join.is_finished() {
            join.abort();
        }

        match run {
            Run::Interrupted(Signal::Cancel(reason)) => {
                info!(%reason, "task cancelled while running");
                ExecutionOutcome::Cancelled
            }
            Run::Interrupted(_) => self.return_to_queue(&task, &signal).await,
            Run::Finished(Ok(value)) => self.complete(&task, value, &signal).await,
            Run::Finished(Err(err)) => self.handle_failure(&task, err, &signal).await,
        }
    }

    async fn complete(
        &self,
        task: &Task,
        value: serde_json::Value,
        signal: &watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        let now = self.clock.now();
        let patch = TaskPatch::new()
            .status(TaskStatus::Completed)
            .progress(100)
            .result(value)
            .clear_error_message()
            .completed_at(Some(now))
            .log(log_line(now, "Completed"));
        match self.write(task.id, patch, signal).await {
            Ok(()) => {
                info!("task completed");
                ExecutionOutcome::Completed
            }
            Err(outcome) => outcome,
        }
    }

    async fn handle_failure(
        &self,
        task: &Task,
        err: HandlerError,
        signal: &watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        match self.policy.decide(task.retry_count, task.max_retries, &err) {
            RetryDecision::Requeue {
                attempt,
                delay,
                reason,
            } => {
                let now = self.clock.now();
                let note = format!("Retry {attempt}/{}: {reason}", task.max_retries);
                let run_after = chrono::Duration::from_std(delay)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .map(|d| now + d);
                let patch = TaskPatch::new()
                    .status(TaskStatus::Pending)
                    .retry_count(attempt)
                    .progress(0)
                    .started_at(None)
                    .run_after(run_after)
                    .error_message(note.clone())
                    .log(log_line(now, &note));
                match self.write(task.id, patch, signal).await {
                    Ok(()) => {
                        warn!(attempt, max_retries = task.max_retries, ?delay, error = %reason, "task requeued");
                        ExecutionOutcome::Requeued { attempt }
                    }
                    Err(outcome) => outcome,
                }
            }
            RetryDecision::Fail { reason } => self.fail(task, reason, signal).await,
            RetryDecision::Cancel => self.handler_cancelled(task, signal).await,
        }
    }

    async fn fail(
        &self,
        task: &Task,
        reason: String,
        signal: &watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        let now = self.clock.now();
        let patch = TaskPatch::new()
            .status(TaskStatus::Failed)
            .error_message(reason.clone())
            .completed_at(Some(now))
            .log(log_line(now, &format!("Failed: {reason}")));
        match self.write(task.id, patch, signal).await {
            Ok(()) => {
                error!(error = %reason, retry_count = task.retry_count, "task failed");
                ExecutionOutcome::Failed
            }
            Err(outcome) => outcome,
        }
    }

    /// The handler gave up on its own. Usually the task already left Running
    /// and the write below is superseded.
    async fn handler_cancelled(
        &self,
        task: &Task,
        signal: &watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        let now = self.clock.now();
        let patch = TaskPatch::new()
            .status(TaskStatus::Cancelled)
            .error_message("Cancelled by handler")
            .completed_at(Some(now))
            .log(log_line(now, "Cancelled by handler"));
        match self.write(task.id, patch, signal).await {
            Ok(()) => {
                info!("task cancelled by its handler");
                ExecutionOutcome::Cancelled
            }
            Err(outcome) => outcome,
        }
    }

    async fn return_to_queue(
        &self,
        task: &Task,
        signal: &watch::Receiver<Signal>,
    ) -> ExecutionOutcome {
        let now = self.clock.now();
        let patch = TaskPatch::new()
            .status(TaskStatus::Pending)
            .progress(0)
            .started_at(None)
            .log(log_line(now, "Interrupted by shutdown, returned to queue"));
        match self.write(task.id, patch, signal).await {
            Ok(()) => {
                info!("task returned to queue on shutdown");
                ExecutionOutcome::Interrupted
            }
            Err(outcome) => outcome,
        }
    }

    /// Write guarded by `expect_status = Running`.
    ///
    /// Transient store failures are retried until the write lands or the
    /// scheduler shuts down.
    async fn write(
        &self,
        id: TaskId,
        patch: TaskPatch,
        signal: &watch::Receiver<Signal>,
    ) -> Result<(), ExecutionOutcome> {
        let patch = patch.expect(TaskStatus::Running);
        let mut shutdown = signal.clone();
        let mut pause = self.storage_retry.delay;
        loop {
            let result = with_storage_retry(self.storage_retry, || {
                self.store.update(id, patch.clone())
            })
            .await;

            match result {
                Ok(_) => return Ok(()),
                Err(
                    err @ (StorageError::Conflict { .. }
                    | StorageError::Terminal { .. }
                    | StorageError::NotFound(_)),
                ) => {
                    debug!(error = %err, "task changed while running, write discarded");
                    return Err(ExecutionOutcome::Superseded);
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, ?pause, "task store unavailable, holding task state");
                    tokio::select! {
                        biased;
                        _ = shutdown_requested(&mut shutdown) => {
                            error!(error = %err, "shutdown during store outage, task left for recovery");
                            return Err(ExecutionOutcome::StorageFailed);
                        }
                        _ = tokio::time::sleep(pause) => {}
                    }
                    pause = pause.saturating_mul(2).min(MAX_WRITE_BACKOFF);
                }
                Err(err) => {
                    error!(error = %err, "failed to record task state");
                    return Err(ExecutionOutcome::StorageFailed);
                }
            }
        }
    }
}

/// Resolves with the first non-`Run` signal. A dropped sender counts as
/// shutdown.
async fn interrupted(signal: &mut watch::Receiver<Signal>) -> Signal {
    match signal.wait_for(|s| *s != Signal::Run).await {
        Ok(s) => s.clone(),
        Err(_) => Signal::Shutdown,
    }
}

/// Resolves once shutdown is signalled. A dropped sender counts as shutdown.
async fn shutdown_requested(signal: &mut watch::Receiver<Signal>) {
    let _ = signal.wait_for(|s| *s == Signal::Shutdown).await;
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

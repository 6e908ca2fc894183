//! TaskContext - what a running handler may do to its own task.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};

use crate::domain::{HandlerError, StorageError, TaskId, TaskPatch, TaskStatus, log_line};
use crate::ports::{Clock, TaskStore};

/// Control signal sent to one executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Run,
    /// The task was cancelled; carries the reason.
    Cancel(String),
    /// The scheduler is stopping; the task goes back to Pending.
    Shutdown,
}

/// Handle given to a handler for the duration of one Running episode.
///
/// Writes go straight to the store guarded by `expect_status = Running`, so
/// once the task has been cancelled or deleted every write fails with
/// [`HandlerError::Cancelled`].
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    signal: watch::Receiver<Signal>,
    /// Last progress the store accepted.
    progress: Arc<Mutex<u8>>,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        signal: watch::Receiver<Signal>,
    ) -> Self {
        Self {
            task_id,
            store,
            clock,
            signal,
            progress: Arc::new(Mutex::new(0)),
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        *self.signal.borrow() != Signal::Run
    }

    /// Resolves once the task is asked to stop.
    pub async fn cancelled(&self) {
        let mut rx = self.signal.clone();
        // A dropped sender means the executor is gone; stop as well.
        let _ = rx.wait_for(|s| *s != Signal::Run).await;
    }

    /// Report progress in percent. Values above 100 are clamped and values
    /// below the last stored report are ignored. A failed write can be
    /// retried with the same value.
    pub async fn progress(&self, percent: u8) -> Result<(), HandlerError> {
        self.ensure_running()?;
        let percent = percent.min(100);
        let mut stored = self.progress.lock().await;
        if percent <= *stored {
            return Ok(());
        }
        self.write(TaskPatch::new().progress(percent)).await?;
        *stored = percent;
        Ok(())
    }

    /// Append a timestamped line to the task log.
    pub async fn log(&self, message: impl AsRef<str>) -> Result<(), HandlerError> {
        self.ensure_running()?;
        let line = log_line(self.clock.now(), message.as_ref());
        self.write(TaskPatch::new().log(line)).await
    }

    fn ensure_running(&self) -> Result<(), HandlerError> {
        if self.is_cancelled() {
            return Err(HandlerError::Cancelled);
        }
        Ok(())
    }

    async fn write(&self, patch: TaskPatch) -> Result<(), HandlerError> {
        self.store
            .update(self.task_id, patch.expect(TaskStatus::Running))
            .await
            .map(|_| ())
            .map_err(|err| match err {
                StorageError::Conflict { .. }
                | StorageError::Terminal { .. }
                | StorageError::NotFound(_) => HandlerError::Cancelled,
                other => HandlerError::Storage(other),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ClaimCriteria, NewTask, Task, TaskType};
    use crate::impls::InMemoryTaskStore;
    use crate::impls::flaky_store::FlakyStore;
    use crate::ports::SystemClock;
    use ulid::Ulid;

    async fn running_task() -> (Arc<InMemoryTaskStore>, TaskId) {
        let store = Arc::new(InMemoryTaskStore::default());
        let now = chrono::Utc::now();
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("alice", TaskType::Organize, "/organize ~/Downloads"),
            now,
        );
        let id = task.id;
        store.create(task).await.unwrap();
        store.claim_next(&ClaimCriteria::new(now)).await.unwrap();
        (store, id)
    }

    fn context(
        store: &Arc<InMemoryTaskStore>,
        id: TaskId,
    ) -> (watch::Sender<Signal>, TaskContext) {
        let (tx, rx) = watch::channel(Signal::Run);
        let ctx = TaskContext::new(id, store.clone(), Arc::new(SystemClock), rx);
        (tx, ctx)
    }

    #[tokio::test]
    async fn progress_is_monotonic_and_clamped() {
        let (store, id) = running_task().await;
        let (_tx, ctx) = context(&store, id);

        ctx.progress(40).await.unwrap();
        ctx.progress(20).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 40);

        ctx.progress(250).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn progress_retried_after_store_outage_is_written() {
        let (store, id) = running_task().await;
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let (_tx, rx) = watch::channel(Signal::Run);
        let ctx = TaskContext::new(id, flaky.clone(), Arc::new(SystemClock), rx);

        flaky.fail_writes(true);
        assert!(matches!(ctx.progress(30).await, Err(HandlerError::Storage(_))));
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 0);

        flaky.fail_writes(false);
        ctx.progress(30).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().progress, 30);
    }

    #[tokio::test]
    async fn log_lines_are_appended() {
        let (store, id) = running_task().await;
        let (_tx, ctx) = context(&store, id);

        ctx.log("scanning").await.unwrap();
        ctx.log("moving files").await.unwrap();

        let logs = store.get(id).await.unwrap().unwrap().logs;
        assert_eq!(logs.len(), 2);
        assert!(logs[0].ends_with("] scanning"));
        assert!(logs[1].ends_with("] moving files"));
    }

    #[tokio::test]
    async fn writes_fail_after_cancel_signal() {
        let (store, id) = running_task().await;
        let (tx, ctx) = context(&store, id);

        tx.send(Signal::Cancel("stop".into())).unwrap();
        assert!(ctx.is_cancelled());
        ctx.cancelled().await;
        assert_eq!(ctx.progress(50).await, Err(HandlerError::Cancelled));
        assert_eq!(ctx.log("late").await, Err(HandlerError::Cancelled));
    }

    #[tokio::test]
    async fn writes_fail_once_task_left_running() {
        let (store, id) = running_task().await;
        let (_tx, ctx) = context(&store, id);

        store
            .update(
                id,
                TaskPatch::new()
                    .status(TaskStatus::Cancelled)
                    .error_message("Cancelled by user"),
            )
            .await
            .unwrap();
        assert_eq!(ctx.progress(10).await, Err(HandlerError::Cancelled));
    }
}

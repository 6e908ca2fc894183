//! TaskStore port - the single source of truth for task records.
//!
//! Every state change goes through [`TaskStore::update`] or
//! [`TaskStore::claim_next`], and both validate the transition against the
//! status machine. A durable backend implements this trait; the crate ships
//! an in-memory one in [`crate::impls`].

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{
    ClaimCriteria, Page, PageRequest, StatusCounts, StorageError, Task, TaskFilter, TaskId,
    TaskOrder, TaskPatch,
};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails with `Duplicate` if the id exists.
    async fn create(&self, task: Task) -> Result<Task, StorageError>;

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StorageError>;

    /// Apply a partial update atomically and return the new record.
    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError>;

    /// Returns `false` if there was nothing to delete.
    async fn delete(&self, id: TaskId) -> Result<bool, StorageError>;

    async fn list(
        &self,
        filter: &TaskFilter,
        order: TaskOrder,
        page: PageRequest,
    ) -> Result<Page<Task>, StorageError>;

    /// Atomically move the best eligible Pending task to Running.
    ///
    /// Two concurrent callers never receive the same task.
    async fn claim_next(&self, criteria: &ClaimCriteria) -> Result<Option<Task>, StorageError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StorageError>;
}

/// Bounded retry of transient storage failures.
#[derive(Debug, Clone, Copy)]
pub struct StorageRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StorageRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_millis(200),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or `retry.attempts` is spent.
pub async fn with_storage_retry<T, F, Fut>(retry: StorageRetry, mut op: F) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < retry.attempts => {
                tracing::warn!(attempt, error = %err, "task store unavailable, retrying");
                attempt += 1;
                tokio::time::sleep(retry.delay).await;
            }
            other => return other,
        }
    }
}

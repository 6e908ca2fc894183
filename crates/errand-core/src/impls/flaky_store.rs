//! Test wrapper that makes `update` fail with `Unavailable` on demand.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::memory_store::InMemoryTaskStore;
use crate::domain::{
    ClaimCriteria, Page, PageRequest, StatusCounts, StorageError, Task, TaskFilter, TaskId,
    TaskOrder, TaskPatch,
};
use crate::ports::TaskStore;

pub(crate) struct FlakyStore {
    inner: Arc<InMemoryTaskStore>,
    /// Every update fails.
    writes_down: AtomicBool,
    /// Only updates that change the status fail.
    status_writes_down: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<InMemoryTaskStore>) -> Self {
        Self {
            inner,
            writes_down: AtomicBool::new(false),
            status_writes_down: AtomicBool::new(false),
        }
    }

    pub(crate) fn fail_writes(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    pub(crate) fn fail_status_writes(&self, down: bool) {
        self.status_writes_down.store(down, Ordering::SeqCst);
    }

    fn refuses(&self, patch: &TaskPatch) -> bool {
        self.writes_down.load(Ordering::SeqCst)
            || (patch.status.is_some() && self.status_writes_down.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn create(&self, task: Task) -> Result<Task, StorageError> {
        self.inner.create(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError> {
        if self.refuses(&patch) {
            return Err(StorageError::Unavailable("simulated outage".to_string()));
        }
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StorageError> {
        self.inner.delete(id).await
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        order: TaskOrder,
        page: PageRequest,
    ) -> Result<Page<Task>, StorageError> {
        self.inner.list(filter, order, page).await
    }

    async fn claim_next(&self, criteria: &ClaimCriteria) -> Result<Option<Task>, StorageError> {
        self.inner.claim_next(criteria).await
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StorageError> {
        self.inner.count_by_status().await
    }
}

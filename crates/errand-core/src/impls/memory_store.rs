//! In-memory task store.
//!
//! One async mutex guards every record, so each operation is atomic and two
//! claimers can never take the same task. Status changes are also appended to
//! a transition log, which is what tests use to assert that a task only ever
//! walked legal edges. Deleting a task drops its transitions too.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    ClaimCriteria, Page, PageRequest, StatusCounts, StorageError, Task, TaskFilter, TaskId,
    TaskOrder, TaskPatch, TaskStatus,
};
use crate::ports::{Clock, SystemClock, TaskStore};

/// One status change, as observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
}

struct Entry {
    task: Task,
    /// Insertion order, breaks ties between equal `created_at`.
    seq: u64,
}

#[derive(Default)]
struct StoreState {
    entries: HashMap<TaskId, Entry>,
    next_seq: u64,
    transitions: Vec<TransitionRecord>,
}

impl StoreState {
    fn apply(
        &mut self,
        id: TaskId,
        patch: &TaskPatch,
        now: DateTime<Utc>,
    ) -> Result<Task, StorageError> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        let from = entry.task.status;
        patch.apply(&mut entry.task, now)?;
        let task = entry.task.clone();

        if task.status != from {
            self.transitions.push(TransitionRecord {
                task_id: id,
                from,
                to: task.status,
                at: now,
            });
        }
        Ok(task)
    }

    fn sorted(&self, filter: &TaskFilter, order: TaskOrder) -> Vec<&Entry> {
        let mut matching: Vec<&Entry> = self
            .entries
            .values()
            .filter(|e| filter.matches(&e.task))
            .collect();
        match order {
            TaskOrder::CreatedDesc => {
                matching.sort_by_key(|e| Reverse((e.task.created_at, e.seq)));
            }
            TaskOrder::AdmissionOrder => {
                matching.sort_by_key(|e| admission_key(e));
            }
        }
        matching
    }
}

/// Higher priority first, then oldest, then first inserted.
fn admission_key(entry: &Entry) -> (Reverse<u8>, DateTime<Utc>, u64) {
    (Reverse(entry.task.priority), entry.task.created_at, entry.seq)
}

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
        }
    }

    /// Status changes of one task, oldest first.
    pub async fn history(&self, id: TaskId) -> Vec<TransitionRecord> {
        let state = self.state.lock().await;
        state
            .transitions
            .iter()
            .filter(|t| t.task_id == id)
            .cloned()
            .collect()
    }

    /// Every status change in the store, oldest first.
    pub async fn transitions(&self) -> Vec<TransitionRecord> {
        self.state.lock().await.transitions.clone()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<Task, StorageError> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&task.id) {
            return Err(StorageError::Duplicate(task.id));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            task.id,
            Entry {
                task: task.clone(),
                seq,
            },
        );
        Ok(task)
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StorageError> {
        let state = self.state.lock().await;
        Ok(state.entries.get(&id).map(|e| e.task.clone()))
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.apply(id, &patch, now)
    }

    async fn delete(&self, id: TaskId) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        if state.entries.remove(&id).is_none() {
            return Ok(false);
        }
        state.transitions.retain(|t| t.task_id != id);
        Ok(true)
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        order: TaskOrder,
        page: PageRequest,
    ) -> Result<Page<Task>, StorageError> {
        let state = self.state.lock().await;
        let matching = state.sorted(filter, order);
        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset())
            .take(page.per_page)
            .map(|e| e.task.clone())
            .collect();
        Ok(Page::new(items, total, page))
    }

    async fn claim_next(&self, criteria: &ClaimCriteria) -> Result<Option<Task>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let best = state
            .entries
            .values()
            .filter(|e| e.task.is_eligible(criteria.now) && !criteria.exclude.contains(&e.task.id))
            .min_by_key(|e| admission_key(e))
            .map(|e| e.task.id);

        let Some(id) = best else {
            return Ok(None);
        };

        let patch = TaskPatch::new()
            .expect(TaskStatus::Pending)
            .status(TaskStatus::Running)
            .progress(0)
            .started_at(Some(now))
            .run_after(None);
        state.apply(id, &patch, now).map(Some)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StorageError> {
        let state = self.state.lock().await;
        let mut counts = StatusCounts::default();
        for entry in state.entries.values() {
            counts.record(entry.task.status);
        }
        Ok(counts)
    }
}

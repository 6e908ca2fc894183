//! Listing, paging and claim criteria.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::state::TaskStatus;
use super::task::Task;
use super::task_type::TaskType;

pub const MAX_PER_PAGE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub owner_id: Option<String>,
    /// Empty means any status.
    pub statuses: Vec<TaskStatus>,
    pub task_type: Option<TaskType>,
    /// Only tasks whose `completed_at` is strictly before this instant.
    pub completed_before: Option<DateTime<Utc>>,
}

impl TaskFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task_type = Some(task_type);
        self
    }

    /// Terminal tasks that completed before `cutoff`.
    pub fn expired(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: TaskStatus::TERMINAL.to_vec(),
            completed_before: Some(cutoff),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if let Some(owner) = &self.owner_id
            && &task.owner_id != owner
        {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(task_type) = self.task_type
            && task.task_type != task_type
        {
            return false;
        }
        if let Some(cutoff) = self.completed_before {
            return task.completed_at.is_some_and(|at| at < cutoff);
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskOrder {
    /// Newest first (listing API).
    #[default]
    CreatedDesc,
    /// Priority descending, then oldest first (dispatcher).
    AdmissionOrder,
}

/// 1-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub per_page: usize,
}

impl PageRequest {
    pub fn new(page: usize, per_page: usize) -> Self {
        Self { page, per_page }
    }

    pub fn first(per_page: usize) -> Self {
        Self::new(1, per_page)
    }

    /// Saturates: a page far past the end yields an empty page.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.per_page)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: usize, request: PageRequest) -> Self {
        Self {
            items,
            total,
            page: request.page,
            per_page: request.per_page,
            has_next: total > request.page.saturating_mul(request.per_page),
            has_prev: request.page > 1,
        }
    }
}

/// What the dispatcher is willing to claim.
#[derive(Debug, Clone, Default)]
pub struct ClaimCriteria {
    /// Tasks whose `run_after` is later than this are skipped.
    pub now: DateTime<Utc>,
    /// Ids already in flight locally.
    pub exclude: HashSet<TaskId>,
}

impl ClaimCriteria {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            exclude: HashSet::new(),
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = TaskId>) -> Self {
        self.exclude.extend(ids);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_flags() {
        let page: Page<u8> = Page::new(vec![1, 2], 5, PageRequest::new(2, 2));
        assert!(page.has_next);
        assert!(page.has_prev);

        let last: Page<u8> = Page::new(vec![5], 5, PageRequest::new(3, 2));
        assert!(!last.has_next);
    }

    #[test]
    fn offset_is_zero_based() {
        assert_eq!(PageRequest::new(1, 20).offset(), 0);
        assert_eq!(PageRequest::new(3, 20).offset(), 40);
    }

    #[test]
    fn huge_page_numbers_saturate() {
        let request = PageRequest::new(usize::MAX, 100);
        assert_eq!(request.offset(), usize::MAX);

        let page: Page<u8> = Page::new(Vec::new(), 3, request);
        assert!(!page.has_next);
        assert!(page.has_prev);
    }
}

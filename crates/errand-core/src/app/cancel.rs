//! Cancellation controller.
//!
//! The store write comes first (compare-and-set from the status just read),
//! the executor interrupt second. A task can therefore never be observed as
//! Cancelled and later produce a result: every executor write expects
//! Running and loses against the cancel.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::dispatcher::DispatcherHandle;
use crate::domain::{StorageError, TaskId, TaskPatch, TaskStatus, log_line};
use crate::ports::{Authorizer, Clock, TaskStore};

pub const DEFAULT_CANCEL_REASON: &str = "Cancelled by user";

/// Attempts before giving up on a task that keeps changing status.
const MAX_CAS_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelRejection {
    NotFound,
    NotOwner,
    AlreadyTerminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<CancelRejection>,
}

impl CancelOutcome {
    pub fn accepted() -> Self {
        Self {
            accepted: true,
            rejection: None,
        }
    }

    pub fn rejected(reason: CancelRejection) -> Self {
        Self {
            accepted: false,
            rejection: Some(reason),
        }
    }
}

pub struct CancellationController {
    store: Arc<dyn TaskStore>,
    authorizer: Arc<dyn Authorizer>,
    clock: Arc<dyn Clock>,
    dispatcher: DispatcherHandle,
}

impl CancellationController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        authorizer: Arc<dyn Authorizer>,
        clock: Arc<dyn Clock>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            store,
            authorizer,
            clock,
            dispatcher,
        }
    }

    /// Cancel a Pending or Running task on behalf of `requester`.
    ///
    /// Rejections are reported in the outcome; only store failures are errors.
    pub async fn cancel(
        &self,
        task_id: TaskId,
        requester: &str,
        reason: Option<&str>,
    ) -> Result<CancelOutcome, StorageError> {
        let reason = reason
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_CANCEL_REASON);

        let mut last_conflict = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(task) = self.store.get(task_id).await? else {
                return Ok(CancelOutcome::rejected(CancelRejection::NotFound));
            };
            if !task.is_owned_by(requester) && !self.authorizer.is_admin(requester) {
                info!(%task_id, requester, "cancel rejected: not the owner");
                return Ok(CancelOutcome::rejected(CancelRejection::NotOwner));
            }
            if task.status.is_terminal() {
                debug!(%task_id, status = %task.status, "cancel ignored: task already finished");
                return Ok(CancelOutcome::rejected(CancelRejection::AlreadyTerminal));
            }

            let now = self.clock.now();
            let patch = TaskPatch::new()
                .expect(task.status)
                .status(TaskStatus::Cancelled)
                .error_message(reason)
                .completed_at(Some(now))
                .log(log_line(now, &format!("Cancelled: {reason}")));

            match self.store.update(task_id, patch).await {
                Ok(_) => {
                    if task.status == TaskStatus::Running {
                        self.dispatcher.interrupt(task_id, reason);
                    }
                    info!(%task_id, requester, from = %task.status, reason, "task cancelled");
                    return Ok(CancelOutcome::accepted());
                }
                Err(err @ StorageError::Conflict { .. }) => {
                    debug!(%task_id, error = %err, "task moved while cancelling, retrying");
                    last_conflict = Some(err);
                }
                Err(StorageError::NotFound(_)) => {
                    return Ok(CancelOutcome::rejected(CancelRejection::NotFound));
                }
                Err(StorageError::Terminal { .. }) => {
                    return Ok(CancelOutcome::rejected(CancelRejection::AlreadyTerminal));
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            StorageError::Unavailable(format!("could not cancel task {task_id}"))
        }))
    }
}

//! Task record and the partial updates that can be applied to it.
//!
//! The record is the wire contract between the scheduler and any UI polling
//! task status; `progress`, `logs` and `status` are eventually consistent from
//! the client's point of view.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::errors::StorageError;
use super::ids::TaskId;
use super::state::TaskStatus;
use super::task_type::TaskType;

pub type Parameters = serde_json::Map<String, serde_json::Value>;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const MAX_RETRIES_LIMIT: u32 = 10;
pub const MAX_COMMAND_LEN: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub owner_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub command: String,
    #[serde(default)]
    pub parameters: Parameters,

    pub status: TaskStatus,
    /// 0..=100, written by the executor while Running.
    #[serde(default)]
    pub progress: u8,
    /// Set exactly once, on Completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Append-only, `[<rfc3339>] message`.
    #[serde(default)]
    pub logs: Vec<String>,

    pub priority: u8,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Hint in seconds, never enforced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<u64>,
    /// Earliest time the dispatcher may claim this task (retry backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_after: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a fresh Pending record from a validated request.
    pub fn new(id: TaskId, request: NewTask, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner_id: request.owner_id,
            context_ref: request.context_ref,
            task_type: request.task_type,
            command: request.command,
            parameters: request.parameters,
            status: TaskStatus::Pending,
            progress: 0,
            result: None,
            error_message: None,
            logs: Vec::new(),
            priority: request.priority,
            retry_count: 0,
            max_retries: request.max_retries,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            estimated_duration: request.estimated_duration,
            run_after: None,
        }
    }

    pub fn is_owned_by(&self, principal: &str) -> bool {
        self.owner_id == principal
    }

    /// Can the dispatcher claim this task at `now`?
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.run_after.is_none_or(|at| at <= now)
    }
}

/// Format one log entry.
pub fn log_line(at: DateTime<Utc>, message: &str) -> String {
    format!("[{}] {}", at.to_rfc3339_opts(SecondsFormat::Secs, true), message)
}

/// Request to create a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub owner_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub command: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub context_ref: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub estimated_duration: Option<u64>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewTask {
    pub fn new(owner_id: impl Into<String>, task_type: TaskType, command: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            task_type,
            command: command.into(),
            parameters: Parameters::new(),
            context_ref: None,
            priority: DEFAULT_PRIORITY,
            max_retries: DEFAULT_MAX_RETRIES,
            estimated_duration: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_context_ref(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_estimated_duration(mut self, secs: u64) -> Self {
        self.estimated_duration = Some(secs);
        self
    }
}

/// Partial update of a task record.
///
/// `Option<Option<_>>` fields distinguish "leave alone" (`None`) from
/// "clear" (`Some(None)`). Log lines are appended, never replaced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskPatch {
    /// Compare-and-set guard: the update only applies in this status.
    pub expect_status: Option<TaskStatus>,
    pub status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<Option<String>>,
    pub append_logs: Vec<String>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub run_after: Option<Option<DateTime<Utc>>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect(mut self, status: TaskStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(Some(message.into()));
        self
    }

    pub fn clear_error_message(mut self) -> Self {
        self.error_message = Some(None);
        self
    }

    pub fn log(mut self, line: String) -> Self {
        self.append_logs.push(line);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.completed_at = Some(at);
        self
    }

    pub fn run_after(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.run_after = Some(at);
        self
    }

    fn sets_error_message(&self) -> bool {
        matches!(&self.error_message, Some(Some(message)) if !message.trim().is_empty())
    }

    /// Validate the patch against `task` and apply it.
    ///
    /// Either every field is applied or none is.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(expected) = self.expect_status
            && task.status != expected
        {
            return Err(StorageError::Conflict {
                id: task.id,
                expected,
                actual: task.status,
            });
        }

        if task.status.is_terminal() {
            return Err(StorageError::Terminal {
                id: task.id,
                status: task.status,
            });
        }

        let next_status = self.status.unwrap_or(task.status);
        if next_status != task.status && !task.status.can_transition_to(next_status) {
            return Err(StorageError::IllegalTransition {
                id: task.id,
                from: task.status,
                to: next_status,
            });
        }

        if let Some(progress) = self.progress
            && progress > 100
        {
            return Err(StorageError::Invalid(format!(
                "progress {progress} out of range 0..=100"
            )));
        }

        if let Some(retry_count) = self.retry_count
            && retry_count > task.max_retries
        {
            return Err(StorageError::Invalid(format!(
                "retry_count {retry_count} exceeds max_retries {}",
                task.max_retries
            )));
        }

        if self.result.is_some() && next_status != TaskStatus::Completed {
            return Err(StorageError::Invalid(
                "result can only be set on completion".to_string(),
            ));
        }

        if next_status != task.status {
            match next_status {
                TaskStatus::Completed if self.result.is_none() => {
                    return Err(StorageError::Invalid(
                        "completion requires a result".to_string(),
                    ));
                }
                TaskStatus::Failed | TaskStatus::Cancelled if !self.sets_error_message() => {
                    return Err(StorageError::Invalid(format!(
                        "moving to {next_status} requires an error message"
                    )));
                }
                _ => {}
            }
        }

        task.status = next_status;
        if let Some(progress) = self.progress {
            task.progress = progress;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(message) = &self.error_message {
            task.error_message = message.clone();
        }
        task.logs.extend(self.append_logs.iter().cloned());
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        if let Some(at) = self.started_at {
            task.started_at = at;
        }
        if let Some(at) = self.completed_at {
            task.completed_at = at;
        }
        if let Some(at) = self.run_after {
            task.run_after = at;
        }
        task.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pending() -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            NewTask::new("alice", TaskType::Search, "/search invoices"),
            at(0),
        )
    }

    #[test]
    fn new_task_starts_pending_and_empty() {
        let task = pending();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.max_retries, DEFAULT_MAX_RETRIES);
        assert!(task.result.is_none() && task.error_message.is_none());
    }

    #[test]
    fn patch_applies_all_fields_and_bumps_updated_at() {
        let mut task = pending();
        TaskPatch::new()
            .expect(TaskStatus::Pending)
            .status(TaskStatus::Running)
            .started_at(Some(at(5)))
            .log(log_line(at(5), "claimed"))
            .apply(&mut task, at(5))
            .unwrap();

        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.started_at, Some(at(5)));
        assert_eq!(task.logs, vec!["[2023-11-14T22:13:25Z] claimed".to_string()]);
        assert_eq!(task.updated_at, at(5));
    }

    #[test]
    fn expect_status_mismatch_is_a_conflict() {
        let mut task = pending();
        let err = TaskPatch::new()
            .expect(TaskStatus::Running)
            .progress(10)
            .apply(&mut task, at(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn illegal_transition_is_rejected_without_side_effects() {
        let mut task = pending();
        let err = TaskPatch::new()
            .status(TaskStatus::Completed)
            .log("x".to_string())
            .apply(&mut task, at(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::IllegalTransition { .. }));
        assert!(task.logs.is_empty());
        assert_eq!(task.updated_at, at(0));
    }

    #[test]
    fn terminal_task_is_frozen() {
        let mut task = pending();
        TaskPatch::new()
            .status(TaskStatus::Cancelled)
            .error_message("stop")
            .apply(&mut task, at(1))
            .unwrap();
        let before = task.clone();

        let err = TaskPatch::new()
            .log("late".to_string())
            .apply(&mut task, at(2))
            .unwrap_err();
        assert!(matches!(err, StorageError::Terminal { .. }));
        assert_eq!(task, before);
    }

    #[test]
    fn retry_count_cannot_exceed_budget() {
        let mut task = pending();
        let err = TaskPatch::new()
            .retry_count(task.max_retries + 1)
            .apply(&mut task, at(1))
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[test]
    fn result_only_on_completion() {
        let mut task = pending();
        TaskPatch::new()
            .status(TaskStatus::Running)
            .apply(&mut task, at(1))
            .unwrap();
        let err = TaskPatch::new()
            .result(serde_json::json!({"n": 1}))
            .apply(&mut task, at(2))
            .unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    fn running() -> Task {
        let mut task = pending();
        TaskPatch::new()
            .status(TaskStatus::Running)
            .apply(&mut task, at(1))
            .unwrap();
        task
    }

    #[rstest]
    #[case::completed_without_result(TaskPatch::new().status(TaskStatus::Completed))]
    #[case::failed_without_message(TaskPatch::new().status(TaskStatus::Failed))]
    #[case::cancelled_without_message(TaskPatch::new().status(TaskStatus::Cancelled))]
    #[case::cancelled_with_blank_message(
        TaskPatch::new().status(TaskStatus::Cancelled).error_message("  ")
    )]
    #[case::failed_clearing_message(
        TaskPatch::new().status(TaskStatus::Failed).clear_error_message()
    )]
    fn terminal_transition_needs_its_payload(#[case] patch: TaskPatch) {
        let mut task = running();
        let before = task.clone();
        let err = patch.apply(&mut task, at(2)).unwrap_err();
        assert!(matches!(err, StorageError::Invalid(_)));
        assert_eq!(task, before);
    }

    #[rstest]
    #[case(TaskPatch::new().status(TaskStatus::Completed).result(serde_json::json!([])))]
    #[case(TaskPatch::new().status(TaskStatus::Failed).error_message("disk full"))]
    #[case(TaskPatch::new().status(TaskStatus::Cancelled).error_message("Cancelled by user"))]
    fn terminal_transition_with_payload_applies(#[case] patch: TaskPatch) {
        let mut task = running();
        patch.apply(&mut task, at(2)).unwrap();
        assert!(task.status.is_terminal());
    }

    #[test]
    fn run_after_gates_eligibility() {
        let mut task = pending();
        task.run_after = Some(at(10));
        assert!(!task.is_eligible(at(9)));
        assert!(task.is_eligible(at(10)));
    }

    #[test]
    fn wire_format_uses_type_and_omits_empty_optionals() {
        let task = pending();
        let v = serde_json::to_value(&task).unwrap();
        assert_eq!(v["type"], "search");
        assert_eq!(v["status"], "pending");
        assert!(v.get("result").is_none());
        assert!(v.get("error_message").is_none());

        let back: Task = serde_json::from_value(v).unwrap();
        assert_eq!(back, task);
    }
}

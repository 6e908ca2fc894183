//! TaskService - the lifecycle API exposed to the chat backend.
//!
//! Requests are validated here; a rejected request never creates a record.
//! Anything that touches a task's status goes through the store's guarded
//! update, so the service cannot break the status machine either.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::cancel::{CancelOutcome, CancellationController};
use super::command::{is_background_command, parse_command};
use super::dispatcher::DispatcherHandle;
use crate::domain::{
    MAX_COMMAND_LEN, MAX_PER_PAGE, MAX_PRIORITY, MAX_RETRIES_LIMIT, MIN_PRIORITY, NewTask, Page,
    PageRequest, Parameters, SchedulerError, StatusCounts, Task, TaskFilter, TaskId, TaskOrder,
    TaskPatch, TaskStatus, TaskType, log_line,
};
use crate::handler::HandlerRegistry;
use crate::ports::{Authorizer, Clock, IdGenerator, TaskStore};

/// A chat command to run in the background. Type and parameters are derived
/// from the command text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub owner_id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub context_ref: Option<String>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub estimated_duration: Option<u64>,
}

impl CommandRequest {
    pub fn new(owner_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            command: command.into(),
            parameters: Parameters::new(),
            context_ref: None,
            priority: None,
            max_retries: None,
            estimated_duration: None,
        }
    }

    pub fn with_context_ref(mut self, context_ref: impl Into<String>) -> Self {
        self.context_ref = Some(context_ref.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Listing query for one owner. Newest tasks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default, rename = "type")]
    pub task_type: Option<TaskType>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_per_page")]
    pub per_page: usize,
}

fn default_page() -> usize {
    1
}

fn default_per_page() -> usize {
    20
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            status: None,
            task_type: None,
            page: default_page(),
            per_page: default_per_page(),
        }
    }
}

/// Internal update surface (status, progress, result, error, logs).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    #[serde(default)]
    pub status: Option<TaskStatus>,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Plain messages; timestamps are added on write.
    #[serde(default)]
    pub logs: Vec<String>,
}

pub struct TaskService {
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    authorizer: Arc<dyn Authorizer>,
    dispatcher: DispatcherHandle,
    cancellation: CancellationController,
    default_priority: u8,
    default_max_retries: u32,
}

impl TaskService {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        authorizer: Arc<dyn Authorizer>,
        dispatcher: DispatcherHandle,
        default_priority: u8,
        default_max_retries: u32,
    ) -> Self {
        let cancellation = CancellationController::new(
            Arc::clone(&store),
            Arc::clone(&authorizer),
            Arc::clone(&clock),
            dispatcher.clone(),
        );
        Self {
            store,
            registry,
            ids,
            clock,
            authorizer,
            dispatcher,
            cancellation,
            default_priority,
            default_max_retries,
        }
    }

    /// Validate and persist a new Pending task, then wake the dispatcher.
    pub async fn create_task(&self, request: NewTask) -> Result<Task, SchedulerError> {
        self.validate(&request)?;

        let task = Task::new(self.ids.generate_task_id(), request, self.clock.now());
        let task = self.store.create(task).await?;
        info!(
            task_id = %task.id,
            task_type = %task.task_type,
            owner = %task.owner_id,
            priority = task.priority,
            "task created"
        );
        self.dispatcher.wake();
        Ok(task)
    }

    /// Create a task from a chat command.
    ///
    /// Commands that do not need background processing are rejected with
    /// [`SchedulerError::NotBackgroundCommand`].
    pub async fn submit_command(&self, request: CommandRequest) -> Result<Task, SchedulerError> {
        if !is_background_command(&request.command) {
            return Err(SchedulerError::NotBackgroundCommand(request.command));
        }
        let (task_type, parameters) = parse_command(&request.command, request.parameters);

        let mut new_task = NewTask::new(request.owner_id, task_type, request.command)
            .with_parameters(parameters)
            .with_priority(request.priority.unwrap_or(self.default_priority))
            .with_max_retries(request.max_retries.unwrap_or(self.default_max_retries));
        new_task.context_ref = request.context_ref;
        new_task.estimated_duration = request.estimated_duration;

        self.create_task(new_task).await
    }

    pub async fn list_tasks(
        &self,
        owner_id: &str,
        query: ListQuery,
    ) -> Result<Page<Task>, SchedulerError> {
        if query.page == 0 {
            return Err(SchedulerError::InvalidRequest("page must be >= 1".into()));
        }
        if !(1..=MAX_PER_PAGE).contains(&query.per_page) {
            return Err(SchedulerError::InvalidRequest(format!(
                "per_page must be within 1..={MAX_PER_PAGE}"
            )));
        }

        let mut filter = TaskFilter::owner(owner_id);
        if let Some(status) = query.status {
            filter = filter.with_status(status);
        }
        if let Some(task_type) = query.task_type {
            filter = filter.with_type(task_type);
        }
        let page = PageRequest::new(query.page, query.per_page);
        Ok(self.store.list(&filter, TaskOrder::CreatedDesc, page).await?)
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Task, SchedulerError> {
        self.store
            .get(task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))
    }

    /// Like [`get_task`](Self::get_task), for a requester who must own the
    /// task (or be an administrator).
    pub async fn get_owned_task(
        &self,
        task_id: TaskId,
        requester: &str,
    ) -> Result<Task, SchedulerError> {
        let task = self.get_task(task_id).await?;
        self.authorize(&task, requester)?;
        Ok(task)
    }

    /// Direct update of a task's fields.
    ///
    /// Running and Pending are reserved for claiming, retries and recovery,
    /// so they cannot be set here. Completing needs a result and failing or
    /// cancelling needs an error message; the store rejects anything else.
    pub async fn update_task(
        &self,
        task_id: TaskId,
        update: TaskUpdate,
    ) -> Result<Task, SchedulerError> {
        if let Some(status @ (TaskStatus::Running | TaskStatus::Pending)) = update.status {
            return Err(SchedulerError::InvalidRequest(format!(
                "status {status} is managed by the scheduler"
            )));
        }

        let now = self.clock.now();
        let mut patch = TaskPatch::new();
        if let Some(status) = update.status {
            patch = patch.status(status);
            if status.is_terminal() {
                patch = patch.completed_at(Some(now));
            }
        }
        if let Some(progress) = update.progress {
            patch = patch.progress(progress);
        }
        if let Some(result) = update.result {
            patch = patch.result(result);
        }
        if let Some(message) = update.error_message {
            patch = patch.error_message(message);
        }
        for message in &update.logs {
            patch = patch.log(log_line(now, message));
        }
        Ok(self.store.update(task_id, patch).await?)
    }

    pub async fn cancel_task(
        &self,
        task_id: TaskId,
        requester: &str,
        reason: Option<&str>,
    ) -> Result<CancelOutcome, SchedulerError> {
        Ok(self.cancellation.cancel(task_id, requester, reason).await?)
    }

    /// Administrative delete, any status. A running executor is interrupted
    /// first.
    pub async fn delete_task(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        let task = self.get_task(task_id).await?;
        if task.status == TaskStatus::Running {
            self.dispatcher.interrupt(task_id, "Task deleted");
        }
        if !self.store.delete(task_id).await? {
            return Err(SchedulerError::NotFound(task_id));
        }
        info!(%task_id, status = %task.status, "task deleted");
        Ok(())
    }

    pub async fn delete_owned_task(
        &self,
        task_id: TaskId,
        requester: &str,
    ) -> Result<(), SchedulerError> {
        let task = self.get_task(task_id).await?;
        self.authorize(&task, requester)?;
        self.delete_task(task_id).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, SchedulerError> {
        Ok(self.store.count_by_status().await?)
    }

    pub fn registered_types(&self) -> Vec<TaskType> {
        self.registry.registered_types()
    }

    fn authorize(&self, task: &Task, requester: &str) -> Result<(), SchedulerError> {
        if task.is_owned_by(requester) || self.authorizer.is_admin(requester) {
            return Ok(());
        }
        Err(SchedulerError::Unauthorized {
            task_id: task.id,
            requester: requester.to_string(),
        })
    }

    fn validate(&self, request: &NewTask) -> Result<(), SchedulerError> {
        if !self.registry.contains(request.task_type) {
            return Err(SchedulerError::UnknownTaskType(request.task_type.to_string()));
        }
        if request.owner_id.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("owner_id is required".into()));
        }
        let len = request.command.trim().chars().count();
        if len == 0 || len > MAX_COMMAND_LEN {
            return Err(SchedulerError::InvalidRequest(format!(
                "command must be 1..={MAX_COMMAND_LEN} characters"
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&request.priority) {
            return Err(SchedulerError::InvalidRequest(format!(
                "priority must be within {MIN_PRIORITY}..={MAX_PRIORITY}"
            )));
        }
        if request.max_retries > MAX_RETRIES_LIMIT {
            return Err(SchedulerError::InvalidRequest(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::builder::SchedulerBuilder;
    use crate::domain::{ClaimCriteria, StorageError};
    use crate::handler::handler_fn;
    use crate::impls::InMemoryTaskStore;
    use crate::ports::StaticAdmins;
    use rstest::rstest;
    use serde_json::json;

    fn service_with(types: &[TaskType]) -> (Arc<InMemoryTaskStore>, Arc<TaskService>) {
        let store = Arc::new(InMemoryTaskStore::default());
        let mut builder = SchedulerBuilder::new(store.clone()).authorizer(StaticAdmins::new(["ops"]));
        for t in types {
            builder = builder
                .register(*t, handler_fn(|_task, _ctx| async { Ok(json!(null)) }))
                .unwrap();
        }
        let scheduler = builder.build().unwrap();
        (store, scheduler.service())
    }

    fn service() -> (Arc<InMemoryTaskStore>, Arc<TaskService>) {
        service_with(&TaskType::ALL)
    }

    #[tokio::test]
    async fn create_starts_pending_with_defaults() {
        let (_, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search cats"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(service.get_task(task.id).await.unwrap(), task);
    }

    #[tokio::test]
    async fn unregistered_type_never_enters_pending() {
        let (store, service) = service_with(&[TaskType::Search]);
        let err = service
            .create_task(NewTask::new("alice", TaskType::Backup, "backup"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTaskType(t) if t == "backup"));
        assert_eq!(store.count_by_status().await.unwrap(), StatusCounts::default());
    }

    #[rstest]
    #[case(NewTask::new("alice", TaskType::Search, "   "))]
    #[case(NewTask::new("alice", TaskType::Search, "x".repeat(501)))]
    #[case(NewTask::new("alice", TaskType::Search, "/search").with_priority(0))]
    #[case(NewTask::new("alice", TaskType::Search, "/search").with_priority(11))]
    #[case(NewTask::new("alice", TaskType::Search, "/search").with_max_retries(11))]
    #[case(NewTask::new("", TaskType::Search, "/search"))]
    #[tokio::test]
    async fn invalid_requests_are_rejected(#[case] request: NewTask) {
        let (_, service) = service();
        let err = service.create_task(request).await.unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn submit_command_parses_type_and_parameters() {
        let (_, service) = service();
        let task = service
            .submit_command(CommandRequest::new("alice", "/organize ~/Desktop").with_context_ref("chat-1"))
            .await
            .unwrap();
        assert_eq!(task.task_type, TaskType::Organize);
        assert_eq!(task.parameters["path"], json!("~/Desktop"));
        assert_eq!(task.context_ref.as_deref(), Some("chat-1"));
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 3);
    }

    #[tokio::test]
    async fn submit_command_rejects_chit_chat() {
        let (_, service) = service();
        let err = service
            .submit_command(CommandRequest::new("alice", "hello there"))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NotBackgroundCommand(_)));
    }

    #[tokio::test]
    async fn list_is_scoped_filtered_and_paged() {
        let (_, service) = service();
        for i in 0..3 {
            service
                .create_task(NewTask::new("alice", TaskType::Search, format!("/search {i}")))
                .await
                .unwrap();
        }
        service
            .create_task(NewTask::new("alice", TaskType::Backup, "backup"))
            .await
            .unwrap();
        service
            .create_task(NewTask::new("bob", TaskType::Search, "/search bob"))
            .await
            .unwrap();

        let all = service.list_tasks("alice", ListQuery::default()).await.unwrap();
        assert_eq!(all.total, 4);

        let searches = service
            .list_tasks(
                "alice",
                ListQuery {
                    task_type: Some(TaskType::Search),
                    per_page: 2,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(searches.total, 3);
        assert_eq!(searches.items.len(), 2);
        assert!(searches.has_next);

        let err = service
            .list_tasks(
                "alice",
                ListQuery {
                    per_page: 101,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn owned_access_requires_owner_or_admin() {
        let (_, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();

        assert!(service.get_owned_task(task.id, "alice").await.is_ok());
        assert!(service.get_owned_task(task.id, "ops").await.is_ok());
        let err = service.get_owned_task(task.id, "bob").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized { .. }));

        let err = service.delete_owned_task(task.id, "bob").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Unauthorized { .. }));
        service.delete_owned_task(task.id, "alice").await.unwrap();
        assert!(matches!(
            service.get_task(task.id).await.unwrap_err(),
            SchedulerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn update_goes_through_the_status_machine() {
        let (_, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();

        let err = service
            .update_task(
                task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Storage(_)));

        let updated = service
            .update_task(
                task.id,
                TaskUpdate {
                    logs: vec!["queued behind backup".into()],
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(updated.logs[0].ends_with("] queued behind backup"));
    }

    #[rstest]
    #[case::claim_is_owned_by_the_dispatcher(TaskStatus::Running)]
    #[case::requeue_is_owned_by_the_executor(TaskStatus::Pending)]
    #[tokio::test]
    async fn update_cannot_set_scheduler_owned_statuses(#[case] status: TaskStatus) {
        let (store, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();

        let err = service
            .update_task(
                task.id,
                TaskUpdate {
                    status: Some(status),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest(_)));
        assert_eq!(store.get(task.id).await.unwrap().unwrap(), task);
    }

    #[rstest]
    #[case::completed_needs_result(TaskUpdate {
        status: Some(TaskStatus::Completed),
        ..TaskUpdate::default()
    })]
    #[case::failed_needs_message(TaskUpdate {
        status: Some(TaskStatus::Failed),
        ..TaskUpdate::default()
    })]
    #[case::cancelled_needs_message(TaskUpdate {
        status: Some(TaskStatus::Cancelled),
        ..TaskUpdate::default()
    })]
    #[tokio::test]
    async fn update_of_a_running_task_keeps_terminal_payloads(#[case] update: TaskUpdate) {
        let (store, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();
        let running = store
            .claim_next(&ClaimCriteria::new(chrono::Utc::now()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.id, task.id);

        let err = service.update_task(task.id, update).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Storage(StorageError::Invalid(_))));
        assert_eq!(store.get(task.id).await.unwrap().unwrap(), running);

        let done = service
            .update_task(
                task.id,
                TaskUpdate {
                    status: Some(TaskStatus::Completed),
                    result: Some(json!({"hits": 0})),
                    ..TaskUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn huge_page_number_yields_an_empty_page() {
        let (_, service) = service();
        service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();

        let page = service
            .list_tasks(
                "alice",
                ListQuery {
                    page: usize::MAX,
                    ..ListQuery::default()
                },
            )
            .await
            .unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.total, 1);
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn counts_by_status() {
        let (_, service) = service();
        let task = service
            .create_task(NewTask::new("alice", TaskType::Search, "/search x"))
            .await
            .unwrap();
        service
            .create_task(NewTask::new("alice", TaskType::Search, "/search y"))
            .await
            .unwrap();
        service.cancel_task(task.id, "alice", None).await.unwrap();

        let counts = service.counts().await.unwrap();
        assert_eq!((counts.pending, counts.cancelled), (1, 1));
    }
}

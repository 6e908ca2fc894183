//! SchedulerBuilder - wiring and start-up validation.
//!
//! Fail-fast: `build()` refuses to produce a scheduler whose config is
//! invalid or that lacks a handler for a task type it was told to expect.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use super::config::{ConfigError, SchedulerConfig};
use super::dispatcher::{Dispatcher, recover_interrupted};
use super::executor::Executor;
use super::retry::RetryPolicy;
use super::service::TaskService;
use super::sweeper::RetentionSweeper;
use crate::domain::{StorageError, TaskType};
use crate::handler::{DuplicateHandler, HandlerRegistry, TaskHandler};
use crate::ports::{Authorizer, Clock, IdGenerator, OwnerOnly, SystemClock, TaskStore, UlidGenerator};

/// ```ignore
/// let scheduler = SchedulerBuilder::new(store)
///     .config(config)
///     .register(TaskType::Search, SearchHandler::new(index))?
///     .expect_types(&TaskType::ALL)
///     .build()?;
/// let handle = scheduler.start().await?;
/// ```
pub struct SchedulerBuilder {
    store: Arc<dyn TaskStore>,
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    authorizer: Arc<dyn Authorizer>,
    registry: HandlerRegistry,
    expected_types: Option<Vec<TaskType>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing handlers for task types: {0:?}")]
    MissingHandlers(Vec<TaskType>),

    #[error(transparent)]
    DuplicateHandler(#[from] DuplicateHandler),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SchedulerBuilder {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self {
            store,
            config: SchedulerConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            authorizer: Arc::new(OwnerOnly),
            registry: HandlerRegistry::new(),
            expected_types: None,
        }
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to ULIDs stamped by the configured clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    pub fn register(
        mut self,
        task_type: TaskType,
        handler: impl TaskHandler + 'static,
    ) -> Result<Self, BuildError> {
        self.registry.register(task_type, Arc::new(handler))?;
        Ok(self)
    }

    /// Task types that must have a handler when `build()` runs.
    pub fn expect_types(mut self, task_types: &[TaskType]) -> Self {
        self.expected_types = Some(task_types.to_vec());
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_types {
            let missing = self.registry.missing(expected);
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let config = self.config;
        let clock = self.clock;
        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&clock))),
        };
        let registry = Arc::new(self.registry);

        let executor = Executor::new(
            Arc::clone(&self.store),
            Arc::clone(&registry),
            Arc::clone(&clock),
        )
        .with_policy(RetryPolicy::from(&config.retry))
        .with_timeout(config.execution_timeout());

        let (dispatcher, dispatcher_handle) = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::new(executor),
            Arc::clone(&clock),
            config.max_concurrent_tasks,
            config.poll_interval(),
        );

        let sweeper = RetentionSweeper::new(
            Arc::clone(&self.store),
            Arc::clone(&clock),
            config.retention(),
            config.sweep_interval(),
        );

        let service = Arc::new(TaskService::new(
            Arc::clone(&self.store),
            registry,
            ids,
            Arc::clone(&clock),
            self.authorizer,
            dispatcher_handle,
            config.default_priority,
            config.default_max_retries,
        ));

        Ok(Scheduler {
            store: self.store,
            clock,
            service,
            dispatcher,
            sweeper,
        })
    }
}

/// A wired scheduler that has not started its loops yet.
///
/// The service is usable before `start()`: tasks created meanwhile wait in
/// Pending.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    service: Arc<TaskService>,
    dispatcher: Dispatcher,
    sweeper: RetentionSweeper,
}

impl Scheduler {
    pub fn service(&self) -> Arc<TaskService> {
        Arc::clone(&self.service)
    }

    /// Requeue tasks interrupted by a previous run, then spawn the dispatcher
    /// and sweeper loops.
    pub async fn start(self) -> Result<SchedulerHandle, StorageError> {
        recover_interrupted(self.store.as_ref(), self.clock.as_ref()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(self.dispatcher.run(shutdown_rx.clone())),
            tokio::spawn(self.sweeper.run(shutdown_rx)),
        ];
        info!("scheduler started");

        Ok(SchedulerHandle {
            service: self.service,
            shutdown_tx,
            joins,
        })
    }
}

/// Handle to a running scheduler.
/// - dropping the handle (or `request_shutdown()`) stops both loops
/// - `shutdown_and_join()` waits for in-flight tasks to be returned to Pending
pub struct SchedulerHandle {
    service: Arc<TaskService>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn service(&self) -> Arc<TaskService> {
        Arc::clone(&self.service)
    }

    pub fn request_shutdown(&self) {
        // ignore send error: loops may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
        info!("scheduler stopped");
    }
}

//! App - the scheduler itself, built on top of the ports.
//!
//! - **SchedulerBuilder / Scheduler**: wiring, start-up validation, loops
//! - **TaskService**: lifecycle API (create, list, get, update, cancel, delete)
//! - **Dispatcher**: admission loop with a concurrency cap
//! - **Executor**: runs one task and records its outcome
//! - **RetryPolicy**: failure classification and backoff
//! - **CancellationController**: owner-checked cancel of Pending/Running tasks
//! - **RetentionSweeper**: deletes old terminal tasks

pub mod builder;
pub mod cancel;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod retry;
pub mod service;
pub mod sweeper;

pub use self::builder::{BuildError, Scheduler, SchedulerBuilder, SchedulerHandle};
pub use self::cancel::{CancelOutcome, CancelRejection, CancellationController, DEFAULT_CANCEL_REASON};
pub use self::command::{is_background_command, parse_command};
pub use self::config::{ConfigError, LogFormat, LoggingConfig, RetryConfig, SchedulerConfig};
pub use self::dispatcher::{Dispatcher, DispatcherHandle, recover_interrupted};
pub use self::executor::{ExecutionOutcome, Executor};
pub use self::retry::{FailureClass, RetryDecision, RetryPolicy};
pub use self::service::{CommandRequest, ListQuery, TaskService, TaskUpdate};
pub use self::sweeper::RetentionSweeper;

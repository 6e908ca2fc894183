//! errand-core
//!
//! Background task scheduling and execution for a chat backend: admission,
//! bounded concurrent execution, progress tracking, retries, cancellation and
//! retention.
//!
//! # Modules
//! - **domain**: task record, status machine, ids, queries, errors
//! - **ports**: `TaskStore`, `Clock`, `IdGenerator`, `Authorizer`
//! - **impls**: `InMemoryTaskStore`
//! - **handler**: `TaskHandler`, `TaskContext`, `HandlerRegistry`
//! - **app**: builder, service, dispatcher, executor, retry, cancel, sweeper
//! - **telemetry**: tracing subscriber setup

pub mod app;
pub mod domain;
pub mod handler;
pub mod impls;
pub mod ports;
pub mod telemetry;

pub use app::{Scheduler, SchedulerBuilder, SchedulerConfig, SchedulerHandle, TaskService};
pub use domain::{HandlerError, NewTask, SchedulerError, Task, TaskId, TaskStatus, TaskType};
pub use handler::{TaskContext, TaskHandler, handler_fn};

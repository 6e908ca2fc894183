//! Domain model (ids, task record, status machine, errors, queries).

pub mod errors;
pub mod ids;
pub mod query;
pub mod state;
pub mod task;
pub mod task_type;

pub use self::errors::{ErrorKind, HandlerError, SchedulerError, StorageError};
pub use self::ids::{ParseTaskIdError, TaskId};
pub use self::query::{ClaimCriteria, MAX_PER_PAGE, Page, PageRequest, TaskFilter, TaskOrder};
pub use self::state::{StatusCounts, TaskStatus};
pub use self::task::{
    DEFAULT_MAX_RETRIES, DEFAULT_PRIORITY, MAX_COMMAND_LEN, MAX_PRIORITY, MAX_RETRIES_LIMIT,
    MIN_PRIORITY, NewTask, Parameters, Task, TaskPatch, log_line,
};
pub use self::task_type::{TaskType, UnknownTaskType};

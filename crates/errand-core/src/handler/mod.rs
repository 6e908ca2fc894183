//! Task handlers and the registry that maps task types to them.

pub mod context;
#[allow(clippy::module_inception)]
pub mod handler;
pub mod registry;

pub use self::context::{Signal, TaskContext};
pub use self::handler::{FnHandler, TaskHandler, handler_fn};
pub use self::registry::{DuplicateHandler, HandlerRegistry};

//! Ports - the seams between the scheduler and the outside world.
//!
//! - `TaskStore`: durable task records (source of truth)
//! - `Clock`, `IdGenerator`: time and identity, swappable in tests
//! - `Authorizer`: who may act on someone else's task

pub mod authorizer;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::authorizer::{Authorizer, OwnerOnly, StaticAdmins};
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StorageRetry, TaskStore, with_storage_retry};

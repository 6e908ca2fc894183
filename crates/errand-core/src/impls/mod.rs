//! Port implementations shipped with the crate.
//!
//! Durable stores live outside this crate and implement
//! [`crate::ports::TaskStore`] the same way.

#[cfg(test)]
pub(crate) mod flaky_store;
pub mod memory_store;

pub use self::memory_store::{InMemoryTaskStore, TransitionRecord};

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::TaskHandler;
use crate::domain::TaskType;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("a handler for task type '{0}' is already registered")]
pub struct DuplicateHandler(pub TaskType);

/// Registry of handlers (task type -> handler).
///
/// Built once during wiring and read-only afterwards, so lookups need no lock.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), DuplicateHandler> {
        if self.handlers.contains_key(&task_type) {
            return Err(DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Registered types in declaration order.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    /// Which of `expected` have no handler.
    pub fn missing(&self, expected: &[TaskType]) -> Vec<TaskType> {
        let mut missing: Vec<TaskType> = expected
            .iter()
            .copied()
            .filter(|t| !self.contains(*t))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;

    fn noop() -> Arc<dyn TaskHandler> {
        Arc::new(handler_fn(|_task, _ctx| async { Ok(serde_json::Value::Null) }))
    }

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Search, noop()).unwrap();

        assert!(registry.get(TaskType::Search).is_some());
        assert!(registry.get(TaskType::Backup).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Search, noop()).unwrap();
        let err = registry.register(TaskType::Search, noop()).unwrap_err();
        assert_eq!(err, DuplicateHandler(TaskType::Search));
    }

    #[test]
    fn reports_missing_types() {
        let mut registry = HandlerRegistry::new();
        registry.register(TaskType::Cleanup, noop()).unwrap();
        registry.register(TaskType::Organize, noop()).unwrap();

        assert_eq!(
            registry.registered_types(),
            vec![TaskType::Organize, TaskType::Cleanup]
        );
        assert_eq!(
            registry.missing(&[TaskType::Backup, TaskType::Organize, TaskType::Analysis]),
            vec![TaskType::Backup, TaskType::Analysis]
        );
    }
}

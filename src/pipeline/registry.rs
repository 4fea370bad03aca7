//! Mapping from task type to the handler that executes it.

use super::handler::TaskHandler;
use crate::queue::domain::TaskType;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while assembling a [`HandlerRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A handler is already registered for the type.
    #[error("a handler is already registered for task type {0}")]
    AlreadyRegistered(TaskType),
}

/// One handler per task type, assembled before workers start.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `task_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] when the type already has
    /// a handler.
    pub fn register<H>(&mut self, task_type: TaskType, handler: H) -> Result<(), RegistryError>
    where
        H: TaskHandler + 'static,
    {
        self.register_shared(task_type, Arc::new(handler))
    }

    /// Registers an already shared handler for `task_type`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::AlreadyRegistered`] when the type already has
    /// a handler.
    pub fn register_shared(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    /// Returns the handler for `task_type`.
    #[must_use]
    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).map(Arc::clone)
    }

    /// Returns `true` when `task_type` has a handler.
    #[must_use]
    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.handlers.contains_key(task_type)
    }

    /// Iterates registered task types in sorted order.
    pub fn task_types(&self) -> impl Iterator<Item = &TaskType> {
        self.handlers.keys()
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Returns `true` when no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

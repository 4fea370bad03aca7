//! Shared fixtures for in-memory integration tests.

use crate::support::{Failure, Stack};
use buildfix::pipeline::RegistryError;
use buildfix::queue::adapters::memory::InMemoryTaskStore;
use buildfix::queue::domain::TaskType;
use std::sync::Arc;

/// Stack type used across in-memory tests.
pub type MemoryStack = Stack<InMemoryTaskStore>;

/// Builds a stack where every stage succeeds.
pub fn healthy_stack() -> Result<MemoryStack, RegistryError> {
    Stack::new(Arc::new(InMemoryTaskStore::new()), None)
}

/// Builds a stack where `stage` fails with `failure` on every attempt.
pub fn failing_stack(stage: TaskType, failure: Failure) -> Result<MemoryStack, RegistryError> {
    Stack::new(Arc::new(InMemoryTaskStore::new()), Some((stage, failure)))
}

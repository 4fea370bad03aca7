//! Shared world state for pipeline BDD scenarios.

use crate::support::Stack;
use buildfix::queue::adapters::memory::InMemoryTaskStore;
use buildfix::queue::domain::{BuildId, Task, TaskType};
use buildfix::queue::ports::TaskStore;
use rstest::fixture;

/// Stack type driven by the scenarios.
pub type ScenarioStack = Stack<InMemoryTaskStore>;

/// Scenario world for pipeline behaviour tests.
#[derive(Default)]
pub struct PipelineWorld {
    pub stack: Option<ScenarioStack>,
    pub build_id: Option<BuildId>,
}

impl PipelineWorld {
    /// Returns the configured stack.
    pub fn stack(&self) -> eyre::Result<&ScenarioStack> {
        self.stack
            .as_ref()
            .ok_or_else(|| eyre::eyre!("pipeline not configured in scenario world"))
    }

    /// Returns the submitted build identifier.
    pub fn build_id(&self) -> eyre::Result<BuildId> {
        self.build_id
            .ok_or_else(|| eyre::eyre!("no build submitted in scenario world"))
    }

    /// Returns the build's tasks of `stage`, oldest first.
    pub fn tasks_of(&self, stage: &TaskType) -> eyre::Result<Vec<Task>> {
        let stack = self.stack()?;
        let build_id = self.build_id()?;
        let tasks = run_async(stack.queue.store().tasks_for_build(build_id))?;
        Ok(tasks
            .into_iter()
            .filter(|task| task.task_type() == stage)
            .collect())
    }
}

/// Fixture that creates a new scenario world.
#[fixture]
pub fn world() -> PipelineWorld {
    PipelineWorld::default()
}

/// Runs an async operation within sync step definitions.
pub fn run_async<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

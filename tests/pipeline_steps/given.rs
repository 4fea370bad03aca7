//! Given steps for pipeline BDD scenarios.

use super::world::PipelineWorld;
use crate::support::{Failure, Stack};
use buildfix::queue::adapters::memory::InMemoryTaskStore;
use buildfix::queue::domain::TaskType;
use eyre::WrapErr;
use rstest_bdd_macros::given;
use std::sync::Arc;

fn configure(
    world: &mut PipelineWorld,
    failing: Option<(TaskType, Failure)>,
) -> Result<(), eyre::Report> {
    let stack = Stack::new(Arc::new(InMemoryTaskStore::new()), failing)
        .wrap_err("register scenario handlers")?;
    world.stack = Some(stack);
    Ok(())
}

fn stage(name: &str) -> Result<TaskType, eyre::Report> {
    TaskType::new(name).map_err(|err| eyre::eyre!("invalid stage in scenario: {err}"))
}

#[given("a remediation pipeline where every stage succeeds")]
fn every_stage_succeeds(world: &mut PipelineWorld) -> Result<(), eyre::Report> {
    configure(world, None)
}

#[given(r#"a remediation pipeline where the "{name}" stage fails transiently"#)]
fn stage_fails_transiently(world: &mut PipelineWorld, name: String) -> Result<(), eyre::Report> {
    configure(world, Some((stage(&name)?, Failure::Transient)))
}

#[given(r#"a remediation pipeline where the "{name}" stage rejects its input"#)]
fn stage_rejects_input(world: &mut PipelineWorld, name: String) -> Result<(), eyre::Report> {
    configure(world, Some((stage(&name)?, Failure::Validation)))
}

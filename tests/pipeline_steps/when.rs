//! When steps for pipeline BDD scenarios.

use super::world::{PipelineWorld, run_async};
use eyre::WrapErr;
use rstest_bdd_macros::when;

#[when("build {build_number:u64} is submitted")]
fn build_is_submitted(world: &mut PipelineWorld, build_number: u64) -> Result<(), eyre::Report> {
    let submitted = run_async(world.stack()?.submit(build_number)).wrap_err("submit build")?;
    world.build_id = Some(submitted.build.id());
    Ok(())
}

#[when("the dispatchers drain the queue")]
fn dispatchers_drain(world: &mut PipelineWorld) -> Result<(), eyre::Report> {
    run_async(world.stack()?.drain()).wrap_err("drain dispatchers")?;
    Ok(())
}

#[when("an operator retries the build")]
fn operator_retries_build(world: &mut PipelineWorld) -> Result<(), eyre::Report> {
    let build_id = world.build_id()?;
    let summary = run_async(world.stack()?.retry.retry_build(build_id))
        .wrap_err("retry build")?
        .ok_or_else(|| eyre::eyre!("build {build_id} not found"))?;
    if summary.requeued.is_empty() {
        return Err(eyre::eyre!("build retry requeued nothing"));
    }
    Ok(())
}

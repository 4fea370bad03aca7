//! Then steps for pipeline BDD scenarios.

use super::world::{PipelineWorld, run_async};
use buildfix::queue::domain::{BuildStatus, TaskStatus, TaskType};
use buildfix::queue::ports::TaskStore;
use buildfix::queue::services::{MANUAL_INTERVENTION, NOTIFICATION_TYPE_KEY};
use rstest_bdd_macros::then;

fn stage(name: &str) -> Result<TaskType, eyre::Report> {
    TaskType::new(name).map_err(|err| eyre::eyre!("invalid stage in scenario: {err}"))
}

fn task_status(name: &str) -> Result<TaskStatus, eyre::Report> {
    TaskStatus::try_from(name).map_err(|err| eyre::eyre!("invalid task status in scenario: {err}"))
}

#[then(r#"the build status is "{status}""#)]
fn build_status_is(world: &PipelineWorld, status: String) -> Result<(), eyre::Report> {
    let expected = BuildStatus::try_from(status.as_str())
        .map_err(|err| eyre::eyre!("invalid build status in scenario: {err}"))?;
    let build_id = world.build_id()?;
    let build = run_async(world.stack()?.queue.find_build(build_id))?
        .ok_or_else(|| eyre::eyre!("build {build_id} disappeared"))?;
    if build.status() != expected {
        return Err(eyre::eyre!("expected build {expected}, found {}", build.status()));
    }
    Ok(())
}

#[then(r#"{count:usize} tasks of the build are "{status}""#)]
fn tasks_in_status(
    world: &PipelineWorld,
    count: usize,
    status: String,
) -> Result<(), eyre::Report> {
    let expected = task_status(&status)?;
    let build_id = world.build_id()?;
    let tasks = run_async(world.stack()?.queue.store().tasks_for_build(build_id))?;
    let matching = tasks.iter().filter(|task| task.status() == expected).count();
    if matching != count {
        return Err(eyre::eyre!("expected {count} {expected} tasks, found {matching}"));
    }
    Ok(())
}

#[then(r#"the "{name}" task failed after {attempts:u32} attempts"#)]
fn task_failed_after(
    world: &PipelineWorld,
    name: String,
    attempts: u32,
) -> Result<(), eyre::Report> {
    let tasks = world.tasks_of(&stage(&name)?)?;
    let task = tasks
        .first()
        .ok_or_else(|| eyre::eyre!("no {name} task for the build"))?;
    if task.status() != TaskStatus::Failed || task.attempt() != attempts {
        return Err(eyre::eyre!(
            "expected {name} FAILED after {attempts} attempts, found {} after {}",
            task.status(),
            task.attempt()
        ));
    }
    Ok(())
}

#[then(r#"the "{name}" task is "{status}""#)]
fn task_is(world: &PipelineWorld, name: String, status: String) -> Result<(), eyre::Report> {
    let expected = task_status(&status)?;
    let tasks = world.tasks_of(&stage(&name)?)?;
    let task = tasks
        .first()
        .ok_or_else(|| eyre::eyre!("no {name} task for the build"))?;
    if task.status() != expected {
        return Err(eyre::eyre!("expected {name} {expected}, found {}", task.status()));
    }
    Ok(())
}

#[then(r#"a manual intervention notification names the "{name}" stage"#)]
fn notification_names_stage(world: &PipelineWorld, name: String) -> Result<(), eyre::Report> {
    let notifications = world.tasks_of(&TaskType::NOTIFY)?;
    let escalated = notifications.iter().any(|task| {
        task.payload().get_str(NOTIFICATION_TYPE_KEY) == Some(MANUAL_INTERVENTION)
            && task.payload().get_str("failed_stage") == Some(name.as_str())
    });
    if !escalated {
        return Err(eyre::eyre!("no manual intervention notification for {name}"));
    }
    Ok(())
}

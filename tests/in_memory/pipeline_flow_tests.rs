//! Builds driven through every stage against the in-memory store.

use super::helpers::healthy_stack;
use buildfix::queue::domain::{BuildStatus, TaskStatus, TaskType};
use buildfix::queue::ports::TaskStore;
use eyre::{OptionExt, ensure};
use rstest::rstest;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn healthy_pipeline_completes_build() -> eyre::Result<()> {
    let stack = healthy_stack()?;
    let submitted = stack.submit(101).await?;
    stack.drain().await?;

    let build = stack
        .queue
        .find_build(submitted.build.id())
        .await?
        .ok_or_eyre("build disappeared")?;
    ensure!(build.status() == BuildStatus::Completed);

    let tasks = stack.queue.store().tasks_for_build(build.id()).await?;
    let stages: Vec<&str> = tasks.iter().map(|task| task.task_type().as_str()).collect();
    ensure!(
        stages == ["PLAN", "RETRIEVE", "PATCH", "VALIDATE", "PR", "NOTIFY"],
        "unexpected stage order {stages:?}"
    );
    ensure!(tasks.iter().all(|task| task.status() == TaskStatus::Completed));
    ensure!(tasks.iter().all(|task| task.attempt() == 1));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn stage_metadata_accumulates_downstream() -> eyre::Result<()> {
    let stack = healthy_stack()?;
    let submitted = stack.submit(102).await?;
    stack.drain().await?;

    let tasks = stack
        .queue
        .store()
        .tasks_for_build(submitted.build.id())
        .await?;
    let notify = tasks
        .iter()
        .find(|task| task.task_type() == &TaskType::NOTIFY)
        .ok_or_eyre("NOTIFY task missing")?;
    for key in ["plan_done", "retrieve_done", "patch_done", "validate_done", "pr_done"] {
        ensure!(
            notify.payload().get(key) == Some(&serde_json::Value::Bool(true)),
            "NOTIFY payload lacks {key}"
        );
    }
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_builds_do_not_interfere() -> eyre::Result<()> {
    let stack = healthy_stack()?;
    let mut builds = Vec::new();
    for build_number in 200..205 {
        builds.push(stack.submit(build_number).await?.build.id());
    }
    stack.drain().await?;

    for build_id in builds {
        let tasks = stack.queue.store().tasks_for_build(build_id).await?;
        ensure!(tasks.len() == 6, "build {build_id} has {} tasks", tasks.len());
        ensure!(tasks.iter().all(|task| task.build_id() == build_id));
    }
    Ok(())
}

//! Escalation and operator-driven recovery against the in-memory store.

use super::helpers::failing_stack;
use crate::support::Failure;
use buildfix::queue::domain::{BuildId, BuildStatus, Task, TaskStatus, TaskType};
use buildfix::queue::ports::TaskStore;
use buildfix::queue::services::{MANUAL_INTERVENTION, NOTIFICATION_TYPE_KEY};
use eyre::{OptionExt, ensure};
use rstest::rstest;

async fn tasks_of(
    stack: &super::helpers::MemoryStack,
    build_id: BuildId,
    stage: &TaskType,
) -> eyre::Result<Vec<Task>> {
    Ok(stack
        .queue
        .store()
        .tasks_for_build(build_id)
        .await?
        .into_iter()
        .filter(|task| task.task_type() == stage)
        .collect())
}

#[rstest]
#[case(Failure::Transient, 3)]
#[case(Failure::Validation, 1)]
#[tokio::test(flavor = "multi_thread")]
async fn failing_stage_escalates_after_expected_attempts(
    #[case] failure: Failure,
    #[case] expected_attempts: u32,
) -> eyre::Result<()> {
    let stack = failing_stack(TaskType::VALIDATE, failure)?;
    let build_id = stack.submit(301).await?.build.id();
    stack.drain().await?;

    let build = stack
        .queue
        .find_build(build_id)
        .await?
        .ok_or_eyre("build disappeared")?;
    ensure!(build.status() == BuildStatus::Failed);

    let validate = tasks_of(&stack, build_id, &TaskType::VALIDATE).await?;
    let failed = validate.first().ok_or_eyre("VALIDATE task missing")?;
    ensure!(failed.status() == TaskStatus::Failed);
    ensure!(failed.attempt() == expected_attempts, "attempts {}", failed.attempt());
    ensure!(failed.error_message().is_some_and(|message| !message.is_empty()));

    ensure!(tasks_of(&stack, build_id, &TaskType::PR).await?.is_empty());
    let notifications = tasks_of(&stack, build_id, &TaskType::NOTIFY).await?;
    let escalation = notifications.first().ok_or_eyre("escalation missing")?;
    ensure!(escalation.payload().get_str(NOTIFICATION_TYPE_KEY) == Some(MANUAL_INTERVENTION));
    ensure!(escalation.payload().get_str("failed_stage") == Some("VALIDATE"));
    ensure!(escalation.status() == TaskStatus::Completed);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn manual_retry_reruns_with_fresh_attempt_budget() -> eyre::Result<()> {
    let stack = failing_stack(TaskType::PATCH, Failure::Transient)?;
    let build_id = stack.submit(302).await?.build.id();
    stack.drain().await?;

    let patch = tasks_of(&stack, build_id, &TaskType::PATCH).await?;
    let failed = patch.first().ok_or_eyre("PATCH task missing")?;
    ensure!(stack.retry.manual_retry(failed.id()).await?);
    let reopened = stack
        .queue
        .find_build(build_id)
        .await?
        .ok_or_eyre("build disappeared")?;
    ensure!(reopened.status() == BuildStatus::Processing);

    stack.drain().await?;
    let rerun = stack
        .queue
        .find_task(failed.id())
        .await?
        .ok_or_eyre("PATCH task disappeared")?;
    ensure!(rerun.status() == TaskStatus::Failed);
    ensure!(rerun.attempt() == 3);
    ensure!(tasks_of(&stack, build_id, &TaskType::NOTIFY).await?.len() == 2);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn build_retry_skips_completed_stages() -> eyre::Result<()> {
    let stack = failing_stack(TaskType::PR, Failure::Validation)?;
    let build_id = stack.submit(303).await?.build.id();
    stack.drain().await?;

    let summary = stack
        .retry
        .retry_build(build_id)
        .await?
        .ok_or_eyre("build not found")?;
    let pr = tasks_of(&stack, build_id, &TaskType::PR).await?;
    let failed_pr = pr.first().ok_or_eyre("PR task missing")?;
    ensure!(summary.requeued == vec![failed_pr.id()]);

    let patch = tasks_of(&stack, build_id, &TaskType::PATCH).await?;
    ensure!(patch.iter().all(|task| task.status() == TaskStatus::Completed));
    Ok(())
}

//! Skip-locked claim behaviour and claim-bound commits against a real
//! database.

use super::helpers::TestDatabase;
use buildfix::queue::domain::{
    BuildId, BuildStatus, BuildSubmission, Payload, TaskMutation, TaskStatus, TaskType,
};
use buildfix::queue::ports::{TaskStore, TaskStoreError, TaskTransition};
use buildfix::queue::services::{TaskQueueError, TaskQueueService};
use eyre::{OptionExt, ensure};
use mockable::DefaultClock;
use rstest::rstest;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn concurrent_workers_never_share_a_task() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let queue = TaskQueueService::new(database.store(), Arc::new(DefaultClock));
    for build_number in 1..=8 {
        queue
            .submit_build(BuildSubmission::new("acme-app", build_number), TaskType::PLAN)
            .await?;
    }

    let mut workers = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let worker_queue = queue.clone();
        workers.spawn(async move { worker_queue.dequeue(&TaskType::PLAN).await });
    }
    let mut claimed = Vec::new();
    while let Some(joined) = workers.join_next().await {
        if let Some(task) = joined?? {
            claimed.push(task);
        }
    }

    let unique: HashSet<_> = claimed.iter().map(|task| task.id()).collect();
    ensure!(claimed.len() == 8, "claimed {} tasks", claimed.len());
    ensure!(unique.len() == 8, "a task was claimed twice");
    ensure!(claimed.iter().all(|task| task.status() == TaskStatus::InProgress));
    ensure!(claimed.iter().all(|task| task.attempt() == 1));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn claims_follow_creation_order_and_type() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let queue = TaskQueueService::new(database.store(), Arc::new(DefaultClock));
    let first = queue
        .submit_build(BuildSubmission::new("acme-app", 1), TaskType::PLAN)
        .await?;
    queue
        .submit_build(BuildSubmission::new("acme-app", 2), TaskType::PLAN)
        .await?;

    ensure!(queue.dequeue(&TaskType::RETRIEVE).await?.is_none());
    let claimed = queue
        .dequeue(&TaskType::PLAN)
        .await?
        .ok_or_eyre("no PLAN task claimable")?;
    ensure!(claimed.id() == first.first_task.id());
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn backoff_hides_task_until_available() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let queue = TaskQueueService::new(database.store(), Arc::new(DefaultClock));
    queue
        .submit_build(BuildSubmission::new("acme-app", 1), TaskType::PLAN)
        .await?;
    let claimed = queue
        .dequeue(&TaskType::PLAN)
        .await?
        .ok_or_eyre("no PLAN task claimable")?;

    ensure!(
        queue
            .requeue_for_retry_after(claimed.id(), "planner timed out", Duration::from_secs(3600))
            .await?
    );
    ensure!(queue.dequeue(&TaskType::PLAN).await?.is_none());

    let stored = queue
        .find_task(claimed.id())
        .await?
        .ok_or_eyre("task disappeared")?;
    ensure!(stored.status() == TaskStatus::Retry);
    ensure!(stored.available_at().is_some());
    ensure!(stored.error_message() == Some("planner timed out"));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn failed_follow_up_insert_rolls_back_the_transition() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let queue = TaskQueueService::new(database.store(), Arc::new(DefaultClock));
    let submitted = queue
        .submit_build(BuildSubmission::new("acme-app", 1), TaskType::PLAN)
        .await?;
    let claimed = queue
        .dequeue(&TaskType::PLAN)
        .await?
        .ok_or_eyre("no PLAN task claimable")?;
    let orphan = queue.prepare_task(BuildId::new(), TaskType::RETRIEVE, Payload::new())?;
    let completed = TaskMutation::to(TaskStatus::Completed).for_claim(claimed.attempt());
    let transition = TaskTransition::new(completed)
        .moving_build(BuildStatus::Completed, &[BuildStatus::Processing])
        .enqueuing(orphan);

    let result = queue.commit_transition(&claimed, transition).await;

    ensure!(
        matches!(
            result,
            Err(TaskQueueError::Store(TaskStoreError::BuildNotFound(_)))
        ),
        "unexpected result {result:?}"
    );
    let stored = queue
        .find_task(claimed.id())
        .await?
        .ok_or_eyre("task disappeared")?;
    ensure!(stored.status() == TaskStatus::InProgress);
    let build = queue
        .find_build(submitted.build.id())
        .await?
        .ok_or_eyre("build disappeared")?;
    ensure!(build.status() == BuildStatus::Processing);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn commit_from_an_earlier_claim_is_stale() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let queue = TaskQueueService::new(database.store(), Arc::new(DefaultClock));
    let submitted = queue
        .submit_build(BuildSubmission::new("acme-app", 1), TaskType::PLAN)
        .await?;
    let first = queue
        .dequeue(&TaskType::PLAN)
        .await?
        .ok_or_eyre("no PLAN task claimable")?;
    queue.requeue_for_retry(first.id(), "stalled").await?;
    queue
        .dequeue(&TaskType::PLAN)
        .await?
        .ok_or_eyre("PLAN task not reclaimable")?;

    let next = queue.prepare_task(submitted.build.id(), TaskType::RETRIEVE, Payload::new())?;
    let completed = TaskMutation::to(TaskStatus::Completed).for_claim(first.attempt());
    let result = queue
        .commit_transition(&first, TaskTransition::new(completed).enqueuing(next))
        .await;

    ensure!(
        matches!(result, Err(TaskQueueError::StaleClaim(_))),
        "unexpected result {result:?}"
    );
    let tasks = queue.store().tasks_for_build(submitted.build.id()).await?;
    ensure!(tasks.len() == 1);
    Ok(())
}

//! Constraint, listing, statistics, and pipeline tests against a real database.

use super::helpers::TestDatabase;
use crate::support::{Failure, Stack};
use buildfix::queue::domain::{BuildStatus, TaskStatus, TaskType};
use buildfix::queue::ports::{PageRequest, TaskQuery, TaskStore, TaskStoreError};
use buildfix::queue::services::TaskQueueError;
use eyre::{OptionExt, bail, ensure};
use rstest::rstest;

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn duplicate_build_is_rejected() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let stack = Stack::new(database.store(), None)?;
    stack.submit(7).await?;

    match stack.submit(7).await {
        Err(TaskQueueError::Store(TaskStoreError::DuplicateBuild { build_number, .. })) => {
            ensure!(build_number.value() == 7);
        }
        other => bail!("expected duplicate build error, got {other:?}"),
    }
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn pipeline_completes_over_postgres() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let stack = Stack::new(database.store(), None)?;
    let build_id = stack.submit(11).await?.build.id();
    stack.drain().await?;

    let build = stack
        .queue
        .find_build(build_id)
        .await?
        .ok_or_eyre("build disappeared")?;
    ensure!(build.status() == BuildStatus::Completed);
    let tasks = stack.queue.store().tasks_for_build(build_id).await?;
    ensure!(tasks.len() == 6);
    ensure!(tasks.iter().all(|task| task.status() == TaskStatus::Completed));
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn escalation_and_statistics_over_postgres() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let stack = Stack::new(database.store(), Some((TaskType::RETRIEVE, Failure::Transient)))?;
    let build_id = stack.submit(12).await?.build.id();
    stack.submit(13).await?;
    stack.drain().await?;

    let store = stack.queue.store();
    let failed = store
        .list_tasks(
            &TaskQuery {
                status: Some(TaskStatus::Failed),
                build_id: Some(build_id),
            },
            PageRequest::default(),
        )
        .await?;
    ensure!(failed.total == 1);
    let retrieve = failed.items.first().ok_or_eyre("failed task missing")?;
    ensure!(retrieve.task_type() == &TaskType::RETRIEVE);
    ensure!(retrieve.attempt() == 3);

    let builds = store.build_status_counts().await?;
    ensure!(
        builds
            .iter()
            .any(|entry| entry.status == BuildStatus::Failed && entry.count == 2)
    );

    let stats = store.queue_stats().await?;
    ensure!(
        stats
            .completion
            .iter()
            .any(|entry| entry.task_type == TaskType::PLAN && entry.completed == 2)
    );
    let health = store.health().await?;
    ensure!(health.reachable);
    ensure!(health.max_size == 8);
    Ok(())
}

#[rstest]
#[tokio::test(flavor = "multi_thread")]
async fn build_pages_are_bounded() -> eyre::Result<()> {
    let Some(database) = TestDatabase::create().await? else {
        return Ok(());
    };
    let stack = Stack::new(database.store(), None)?;
    for build_number in 1..=5 {
        stack.submit(build_number).await?;
    }

    let store = stack.queue.store();
    let first = store.list_builds(PageRequest::new(0, 2)).await?;
    let last = store.list_builds(PageRequest::new(2, 2)).await?;
    ensure!(first.total == 5);
    ensure!(first.items.len() == 2);
    ensure!(last.items.len() == 1);
    Ok(())
}

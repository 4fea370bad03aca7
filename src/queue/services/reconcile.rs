//! Recovery of tasks left `IN_PROGRESS` by crashed or hung workers.

use super::queue::TaskQueueError;
use super::retry::{ClassifiedError, FailureClass, RetryError, RetryHandler, RetryOutcome};
use crate::queue::{domain::TaskStatus, ports::TaskStore};
use mockable::Clock;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Failure recorded against a task that stopped making progress.
#[derive(Debug, Error)]
#[error("task stalled in IN_PROGRESS for more than {}s", .stale_after.as_secs())]
pub struct StalledTask {
    stale_after: Duration,
}

impl ClassifiedError for StalledTask {
    fn failure_class(&self) -> FailureClass {
        FailureClass::Timeout
    }
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Stale tasks found.
    pub scanned: usize,
    /// Tasks requeued for another attempt.
    pub requeued: usize,
    /// Tasks failed because their attempts were exhausted.
    pub failed: usize,
    /// Tasks that finished on their own before they could be reclaimed.
    pub skipped: usize,
}

/// Periodically returns stale `IN_PROGRESS` tasks to the retry path.
pub struct StaleTaskReconciler<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    retry: RetryHandler<S, C>,
    stale_after: Duration,
}

impl<S, C> StaleTaskReconciler<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a reconciler treating tasks untouched for `stale_after` as stalled.
    #[must_use]
    pub const fn new(retry: RetryHandler<S, C>, stale_after: Duration) -> Self {
        Self { retry, stale_after }
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when the store cannot be scanned or a queue
    /// operation fails for a reason other than a concurrent state change.
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, RetryError> {
        let queue = self.retry.queue();
        let now = queue.clock().utc();
        let cutoff = chrono::Duration::from_std(self.stale_after)
            .ok()
            .and_then(|offset| now.checked_sub_signed(offset))
            .unwrap_or(now);
        let stale = queue
            .store()
            .find_stale_in_progress(cutoff)
            .await
            .map_err(TaskQueueError::from)?;

        let mut report = ReconcileReport {
            scanned: stale.len(),
            ..ReconcileReport::default()
        };
        let failure = StalledTask {
            stale_after: self.stale_after,
        };
        for task in &stale {
            let current = queue.find_task(task.id()).await?;
            if current.is_none_or(|found| found.status() != TaskStatus::InProgress) {
                report.skipped = report.skipped.saturating_add(1);
                continue;
            }
            warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                updated_at = %task.updated_at(),
                "reclaiming stale task"
            );
            match self.retry.handle_task_failure(task, &failure).await {
                Ok(RetryOutcome::Requeued { .. }) => {
                    report.requeued = report.requeued.saturating_add(1);
                }
                Ok(RetryOutcome::Failed { .. }) => {
                    report.failed = report.failed.saturating_add(1);
                }
                Ok(RetryOutcome::Superseded) => {
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(RetryError::Queue(TaskQueueError::InvalidTransition(err))) => {
                    debug!(
                        task_id = %task.id(),
                        error = %err,
                        "stale task changed state concurrently"
                    );
                    report.skipped = report.skipped.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                requeued = report.requeued,
                failed = report.failed,
                skipped = report.skipped,
                "stale task reconciliation finished"
            );
        }
        Ok(report)
    }

    /// Runs passes every `interval` until `shutdown` is cancelled.
    pub async fn run(&self, interval: Duration, shutdown: &CancellationToken) {
        info!(
            stale_after_secs = self.stale_after.as_secs(),
            interval_secs = interval.as_secs(),
            "stale task reconciler started"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(interval) => {
                    if let Err(err) = self.reconcile_once().await {
                        warn!(error = %err, "stale task reconciliation failed");
                    }
                }
            }
        }
        info!("stale task reconciler stopped");
    }
}

//! Operator-facing inspection and manual recovery.

use crate::queue::{
    domain::{Build, BuildId, BuildStatus, Task, TaskId, TaskStatus},
    ports::{
        Page, PageRequest, QueueStats, StatusCount, StoreHealth, TaskQuery, TaskStore,
        TaskStoreError,
    },
    services::{BuildRetrySummary, RetryError, RetryHandler, TaskQueueError},
};
use mockable::Clock;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Pending task count above which health reports degraded.
pub const DEFAULT_PENDING_THRESHOLD: u64 = 100;

/// Errors surfaced by admin operations.
#[derive(Debug, Error)]
pub enum AdminError {
    /// The store failed.
    #[error(transparent)]
    Store(#[from] TaskStoreError),
    /// A queue or retry operation failed.
    #[error(transparent)]
    Retry(#[from] RetryError),
}

impl From<TaskQueueError> for AdminError {
    fn from(err: TaskQueueError) -> Self {
        Self::Retry(RetryError::Queue(err))
    }
}

/// Result type for admin operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// Aggregate counts for `/admin/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminStatus {
    /// Tasks per status.
    pub tasks: Vec<StatusCount<TaskStatus>>,
    /// Builds per status.
    pub builds: Vec<StatusCount<BuildStatus>>,
    /// Store connection pool health.
    pub store: StoreHealth,
}

/// Composite health verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    /// Store reachable and backlog within threshold.
    Up,
    /// Store unreachable or backlog over threshold.
    Degraded,
}

/// Body of `/admin/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Tasks currently `PENDING`.
    pub pending_tasks: u64,
    /// Threshold the backlog is compared against.
    pub pending_threshold: u64,
    /// Store connection pool health.
    pub store: StoreHealth,
}

/// Result of a manual task retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualRetry {
    /// The task was reset to `PENDING`.
    Requeued,
    /// No task has the identifier.
    NotFound,
    /// The task exists but is not `FAILED`.
    NotFailed(TaskStatus),
}

/// Read and recovery operations behind the admin HTTP surface.
pub struct AdminService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    retry: RetryHandler<S, C>,
    pending_threshold: u64,
}

impl<S, C> AdminService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates an admin service sharing the retry handler's store.
    #[must_use]
    pub fn new(retry: RetryHandler<S, C>) -> Self {
        Self {
            store: Arc::clone(retry.queue().store()),
            retry,
            pending_threshold: DEFAULT_PENDING_THRESHOLD,
        }
    }

    /// Overrides the degraded-health backlog threshold.
    #[must_use]
    pub const fn with_pending_threshold(mut self, threshold: u64) -> Self {
        self.pending_threshold = threshold;
        self
    }

    /// Counts tasks and builds by status and reports pool health.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn status(&self) -> AdminResult<AdminStatus> {
        Ok(AdminStatus {
            tasks: self.store.task_status_counts().await?,
            builds: self.store.build_status_counts().await?,
            store: self.store.health().await?,
        })
    }

    /// Lists tasks, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn list_tasks(
        &self,
        query: &TaskQuery,
        page: PageRequest,
    ) -> AdminResult<Page<Task>> {
        Ok(self.store.list_tasks(query, page).await?)
    }

    /// Finds one task.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn task(&self, id: TaskId) -> AdminResult<Option<Task>> {
        Ok(self.store.find_task(id).await?)
    }

    /// Resets a `FAILED` task for another run.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError`] when the store or retry handler fails.
    pub async fn retry_task(&self, id: TaskId) -> AdminResult<ManualRetry> {
        let Some(task) = self.store.find_task(id).await? else {
            return Ok(ManualRetry::NotFound);
        };
        if task.status() != TaskStatus::Failed {
            return Ok(ManualRetry::NotFailed(task.status()));
        }
        if self.retry.manual_retry(id).await? {
            info!(task_id = %id, "manual task retry accepted");
            return Ok(ManualRetry::Requeued);
        }
        let current = self
            .store
            .find_task(id)
            .await?
            .map_or(ManualRetry::NotFound, |found| {
                ManualRetry::NotFailed(found.status())
            });
        Ok(current)
    }

    /// Lists builds, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn list_builds(&self, page: PageRequest) -> AdminResult<Page<Build>> {
        Ok(self.store.list_builds(page).await?)
    }

    /// Finds one build.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn build(&self, id: BuildId) -> AdminResult<Option<Build>> {
        Ok(self.store.find_build(id).await?)
    }

    /// Returns a build's tasks, or `None` when the build does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn build_tasks(&self, id: BuildId) -> AdminResult<Option<Vec<Task>>> {
        if self.store.find_build(id).await?.is_none() {
            return Ok(None);
        }
        Ok(Some(self.store.tasks_for_build(id).await?))
    }

    /// Resets every `FAILED` task of a build.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError`] when the store or retry handler fails.
    pub async fn retry_build(&self, id: BuildId) -> AdminResult<Option<BuildRetrySummary>> {
        Ok(self.retry.retry_build(id).await?)
    }

    /// Returns per-(type, status) counts and completion averages.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn queue_stats(&self) -> AdminResult<QueueStats> {
        Ok(self.store.queue_stats().await?)
    }

    /// Reports `DEGRADED` when the store is unreachable or the pending
    /// backlog exceeds the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::Store`] when the store fails.
    pub async fn health(&self) -> AdminResult<HealthReport> {
        let store = self.store.health().await?;
        let pending_tasks = if store.reachable {
            self.store
                .task_status_counts()
                .await?
                .iter()
                .find(|entry| entry.status == TaskStatus::Pending)
                .map_or(0, |entry| entry.count)
        } else {
            0
        };
        let status = if store.reachable && pending_tasks <= self.pending_threshold {
            HealthStatus::Up
        } else {
            HealthStatus::Degraded
        };
        Ok(HealthReport {
            status,
            pending_tasks,
            pending_threshold: self.pending_threshold,
            store,
        })
    }
}

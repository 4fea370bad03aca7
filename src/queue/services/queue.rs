//! Enqueue, claim, and status-transition API over the task store.

use crate::queue::{
    domain::{
        Build, BuildId, BuildStatus, BuildSubmission, Payload, QueueDomainError, Task, TaskId,
        TaskMutation, TaskStatus, TaskType,
    },
    ports::{BuildUpdate, TaskStore, TaskStoreError, TaskTransition, TransitionCommit},
};
use chrono::{DateTime, Utc};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Service-level errors for queue operations.
#[derive(Debug, Error)]
pub enum TaskQueueError {
    /// Domain validation failed.
    #[error(transparent)]
    Domain(#[from] QueueDomainError),
    /// The task state machine rejected the requested status change.
    #[error("invalid transition: {0}")]
    InvalidTransition(QueueDomainError),
    /// The change came from a claim that no longer owns the task.
    #[error("stale claim: {0}")]
    StaleClaim(QueueDomainError),
    /// The referenced task does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
    /// The store rejected or failed the operation.
    #[error(transparent)]
    Store(TaskStoreError),
}

impl From<TaskStoreError> for TaskQueueError {
    fn from(err: TaskStoreError) -> Self {
        match err {
            TaskStoreError::InvalidTransition(domain @ QueueDomainError::StaleClaim { .. }) => {
                Self::StaleClaim(domain)
            }
            TaskStoreError::InvalidTransition(domain) => Self::InvalidTransition(domain),
            other => Self::Store(other),
        }
    }
}

/// Result type for queue service operations.
pub type TaskQueueResult<T> = Result<T, TaskQueueError>;

/// A newly accepted build and the task that starts its pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedBuild {
    /// The persisted build.
    pub build: Build,
    /// The first pipeline task, `PENDING` with no attempts.
    pub first_task: Task,
}

/// Queue service shared by dispatchers, the retry handler, and admin calls.
pub struct TaskQueueService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    store: Arc<S>,
    clock: Arc<C>,
    max_attempts: u32,
}

impl<S, C> Clone for TaskQueueService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            max_attempts: self.max_attempts,
        }
    }
}

impl<S, C> TaskQueueService<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a queue service using the default attempt budget.
    #[must_use]
    pub const fn new(store: Arc<S>, clock: Arc<C>) -> Self {
        Self {
            store,
            clock,
            max_attempts: Task::DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Sets the attempt budget given to newly enqueued tasks.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Returns the underlying store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Returns the service clock.
    #[must_use]
    pub const fn clock(&self) -> &Arc<C> {
        &self.clock
    }

    /// Accepts a build failure report and enqueues its first pipeline task.
    ///
    /// The first task's payload is the build payload.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Domain`] for invalid submissions and
    /// [`TaskQueueError::Store`] when the build already exists or
    /// persistence fails.
    pub async fn submit_build(
        &self,
        submission: BuildSubmission,
        first_stage: TaskType,
    ) -> TaskQueueResult<SubmittedBuild> {
        let build = Build::new(submission, &*self.clock)?;
        let first_task = self.prepare_task(build.id(), first_stage, build.payload().clone())?;
        self.store.insert_build(&build, &first_task).await?;
        info!(
            build_id = %build.id(),
            job = build.job().as_str(),
            build_number = build.build_number().value(),
            task_id = %first_task.id(),
            task_type = %first_task.task_type(),
            "build submitted"
        );
        Ok(SubmittedBuild { build, first_task })
    }

    /// Persists a new `PENDING` task with no attempts consumed.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when the build is missing or
    /// persistence fails.
    pub async fn enqueue(
        &self,
        build_id: BuildId,
        task_type: TaskType,
        payload: Payload,
    ) -> TaskQueueResult<Task> {
        let task = self.prepare_task(build_id, task_type, payload)?;
        self.store.insert_task(&task).await?;
        info!(
            task_id = %task.id(),
            build_id = %task.build_id(),
            task_type = %task.task_type(),
            "task enqueued"
        );
        Ok(task)
    }

    /// Claims the oldest eligible task of `task_type`, if any.
    ///
    /// An empty queue is `Ok(None)`, never an error.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when persistence fails.
    pub async fn dequeue(&self, task_type: &TaskType) -> TaskQueueResult<Option<Task>> {
        let claimed = self.store.claim_next(task_type, self.clock.utc()).await?;
        if let Some(task) = &claimed {
            debug!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                attempt = task.attempt(),
                "task claimed"
            );
        }
        Ok(claimed)
    }

    /// Moves a task to `status`, optionally recording an error message.
    ///
    /// Returns `None` when the task no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::InvalidTransition`] when the state machine
    /// forbids the change.
    pub async fn update_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        error_message: Option<String>,
    ) -> TaskQueueResult<Option<Task>> {
        let mutation = match error_message {
            Some(message) => TaskMutation::to(status).with_error(message),
            None => TaskMutation::to(status),
        };
        let updated = self
            .store
            .update_task(task_id, &mutation, self.clock.utc())
            .await?;
        match &updated {
            Some(task) => info!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                status = %task.status(),
                "task status updated"
            ),
            None => debug!(
                task_id = %task_id,
                status = %status,
                "status update for missing task ignored"
            ),
        }
        Ok(updated)
    }

    /// Returns `true` while the task has attempts remaining.
    #[must_use]
    pub const fn should_retry(&self, task: &Task) -> bool {
        task.should_retry()
    }

    /// Requeues a task as `RETRY` immediately, or fails it when exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::TaskNotFound`] when the task is missing.
    pub async fn requeue_for_retry(
        &self,
        task_id: TaskId,
        error_message: &str,
    ) -> TaskQueueResult<bool> {
        self.requeue_for_retry_after(task_id, error_message, Duration::ZERO)
            .await
    }

    /// Requeues a task as `RETRY`, claimable again once `delay` has elapsed.
    ///
    /// Returns `true` when requeued. When the attempt budget is exhausted the
    /// task is moved to `FAILED` with the error and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::TaskNotFound`] when the task is missing and
    /// [`TaskQueueError::InvalidTransition`] when the task is not in a state
    /// that can be requeued.
    pub async fn requeue_for_retry_after(
        &self,
        task_id: TaskId,
        error_message: &str,
        delay: Duration,
    ) -> TaskQueueResult<bool> {
        let task = self
            .store
            .find_task(task_id)
            .await?
            .ok_or(TaskQueueError::TaskNotFound(task_id))?;
        let now = self.clock.utc();

        if !task.should_retry() {
            let mutation = TaskMutation::to(TaskStatus::Failed).with_error(error_message);
            self.store.update_task(task_id, &mutation, now).await?;
            warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                attempt = task.attempt(),
                max_attempts = task.max_attempts(),
                "retries exhausted; task failed"
            );
            return Ok(false);
        }

        let available_at = self.available_after(delay);
        let mutation = TaskMutation::to(TaskStatus::Retry)
            .with_error(error_message)
            .available_at(available_at);
        self.store.update_task(task_id, &mutation, now).await?;
        info!(
            task_id = %task.id(),
            build_id = %task.build_id(),
            task_type = %task.task_type(),
            attempt = task.attempt(),
            delay_secs = delay.as_secs(),
            "task requeued for retry"
        );
        Ok(true)
    }

    /// Commits `transition` against `task` as one store operation.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::StaleClaim`] when the mutation is bound to a
    /// claim that was superseded, [`TaskQueueError::TaskNotFound`] when the
    /// task is gone, and [`TaskQueueError::Store`] when persistence fails. No
    /// part of the transition is kept on error.
    pub async fn commit_transition(
        &self,
        task: &Task,
        transition: TaskTransition,
    ) -> TaskQueueResult<TransitionCommit> {
        let commit = self
            .store
            .commit_transition(task.id(), &transition, self.clock.utc())
            .await?
            .ok_or(TaskQueueError::TaskNotFound(task.id()))?;
        info!(
            task_id = %commit.task.id(),
            build_id = %commit.task.build_id(),
            task_type = %commit.task.task_type(),
            status = %commit.task.status(),
            "task status updated"
        );
        if let Some(next) = &commit.enqueued {
            info!(
                task_id = %next.id(),
                build_id = %next.build_id(),
                task_type = %next.task_type(),
                "task enqueued"
            );
        }
        if let Some(BuildUpdate::Updated(build)) = &commit.build {
            info!(build_id = %build.id(), status = %build.status(), "build status updated");
        }
        Ok(commit)
    }

    /// Returns the earliest claim time for a task delayed by `delay`.
    #[must_use]
    pub fn available_after(&self, delay: Duration) -> DateTime<Utc> {
        let now = self.clock.utc();
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|offset| now.checked_add_signed(offset))
            .unwrap_or(now)
    }

    /// Resets a `FAILED` task to `PENDING` with no attempts and no error.
    ///
    /// Returns `false` without side effects when the task is missing or not
    /// `FAILED`.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when persistence fails.
    pub async fn reset_for_manual_retry(&self, task_id: TaskId) -> TaskQueueResult<bool> {
        let Some(task) = self.store.find_task(task_id).await? else {
            return Ok(false);
        };
        if task.status() != TaskStatus::Failed {
            return Ok(false);
        }

        let mutation = TaskMutation::to(TaskStatus::Pending)
            .clearing_error()
            .resetting_attempts();
        match self
            .store
            .update_task(task_id, &mutation, self.clock.utc())
            .await
        {
            Ok(Some(_)) => {
                info!(
                    task_id = %task.id(),
                    build_id = %task.build_id(),
                    task_type = %task.task_type(),
                    "task reset for manual retry"
                );
                Ok(true)
            }
            Ok(None) | Err(TaskStoreError::InvalidTransition(_)) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Finds a task by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when persistence fails.
    pub async fn find_task(&self, task_id: TaskId) -> TaskQueueResult<Option<Task>> {
        Ok(self.store.find_task(task_id).await?)
    }

    /// Finds a build by identifier.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when persistence fails.
    pub async fn find_build(&self, build_id: BuildId) -> TaskQueueResult<Option<Build>> {
        Ok(self.store.find_build(build_id).await?)
    }

    /// Moves a build to `status` when it is currently in one of `only_from`.
    ///
    /// Returns the updated build, or `None` when the build is missing or was
    /// not eligible.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Store`] when persistence fails.
    pub async fn mark_build(
        &self,
        build_id: BuildId,
        status: BuildStatus,
        only_from: &[BuildStatus],
    ) -> TaskQueueResult<Option<Build>> {
        let update = self
            .store
            .update_build_status(build_id, status, only_from, self.clock.utc())
            .await?;
        Ok(match update {
            BuildUpdate::Updated(build) => {
                info!(build_id = %build.id(), status = %build.status(), "build status updated");
                Some(build)
            }
            BuildUpdate::Unchanged(build) => {
                debug!(
                    build_id = %build.id(),
                    current = %build.status(),
                    requested = %status,
                    "build status left unchanged"
                );
                None
            }
            BuildUpdate::Missing => None,
        })
    }

    /// Builds a `PENDING` task with the configured attempt budget without
    /// storing it.
    ///
    /// # Errors
    ///
    /// Returns [`TaskQueueError::Domain`] when the attempt budget is invalid.
    pub fn prepare_task(
        &self,
        build_id: BuildId,
        task_type: TaskType,
        payload: Payload,
    ) -> TaskQueueResult<Task> {
        Task::new(build_id, task_type, payload, &*self.clock)
            .with_max_attempts(self.max_attempts)
            .map_err(TaskQueueError::from)
    }
}

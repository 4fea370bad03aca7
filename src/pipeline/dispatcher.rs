//! Per-type poll loop that claims tasks and drives them to an outcome.

use super::handler::{HandlerError, TaskHandler};
use super::registry::HandlerRegistry;
use super::routing::{Route, StageRouter};
use crate::queue::{
    domain::{
        BuildStatus, Task, TaskId, TaskMutation, TaskResult, TaskResultStatus, TaskStatus,
        TaskType,
    },
    ports::{BuildUpdate, TaskStore, TaskTransition, TransitionCommit},
    services::{RetryError, RetryHandler, RetryOutcome, TaskQueueError, TaskQueueService},
};
use mockable::Clock;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Message stored when a handler fails without explaining why.
const UNEXPLAINED_FAILURE: &str = "handler reported failure without a message";

/// Poll and execution settings for one dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Budget for a single handler invocation.
    pub handler_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            handler_timeout: Duration::from_secs(900),
        }
    }
}

/// Errors that stop a single dispatch. A failed commit leaves nothing
/// behind, so the claimed task stays `IN_PROGRESS` until stale task
/// reconciliation recovers it.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
    /// The retry handler failed.
    #[error(transparent)]
    Retry(#[from] RetryError),
}

/// What one [`StageDispatcher::poll_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No eligible task was waiting.
    Idle,
    /// The task completed and the next stage was enqueued.
    Advanced {
        /// Completed task.
        task_id: TaskId,
        /// Newly enqueued task.
        next_task_id: TaskId,
    },
    /// The task completed and it was the build's last stage.
    Finished {
        /// Completed task.
        task_id: TaskId,
        /// Status the build moved to, or `None` when the build was no longer
        /// `PROCESSING`.
        build_status: Option<BuildStatus>,
    },
    /// The task failed and the router sent the build back to an earlier stage.
    LoopedBack {
        /// Task whose failure triggered the loop-back.
        task_id: TaskId,
        /// Newly enqueued task for the earlier stage.
        next_task_id: TaskId,
    },
    /// The task was requeued for another attempt.
    Retrying {
        /// Requeued task.
        task_id: TaskId,
        /// Backoff before the task becomes claimable.
        delay: Duration,
    },
    /// The task failed terminally.
    Failed {
        /// Failed task.
        task_id: TaskId,
        /// Notification task raised for a human, when one was created.
        escalation_id: Option<TaskId>,
    },
    /// The task was reclaimed while this attempt ran; its result was
    /// discarded without side effects.
    Superseded {
        /// Task whose claim was lost.
        task_id: TaskId,
        /// Attempt that produced the discarded result.
        attempt: u32,
    },
}

/// Claims tasks of one type and runs them through the registered handler.
pub struct StageDispatcher<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    task_type: TaskType,
    registry: Arc<HandlerRegistry>,
    router: Arc<dyn StageRouter>,
    retry: RetryHandler<S, C>,
    config: DispatcherConfig,
}

impl<S, C> StageDispatcher<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a dispatcher for `task_type`.
    #[must_use]
    pub const fn new(
        task_type: TaskType,
        registry: Arc<HandlerRegistry>,
        router: Arc<dyn StageRouter>,
        retry: RetryHandler<S, C>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            task_type,
            registry,
            router,
            retry,
            config,
        }
    }

    /// Returns the task type this dispatcher claims.
    #[must_use]
    pub const fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    const fn queue(&self) -> &TaskQueueService<S, C> {
        self.retry.queue()
    }

    /// Claims one task and drives it to an outcome.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] when the store or the retry handler fails.
    /// Handler failures are outcomes, not errors.
    pub async fn poll_once(&self) -> Result<DispatchOutcome, DispatchError> {
        let Some(task) = self.queue().dequeue(&self.task_type).await? else {
            return Ok(DispatchOutcome::Idle);
        };
        let span = info_span!(
            "dispatch",
            task_id = %task.id(),
            build_id = %task.build_id(),
            task_type = %task.task_type(),
            attempt = task.attempt(),
        );
        self.process(&task).instrument(span).await
    }

    /// Polls until `shutdown` is cancelled. A task already claimed when
    /// cancellation arrives is driven to its outcome first.
    pub async fn run(&self, shutdown: &CancellationToken) {
        info!(task_type = %self.task_type, "dispatcher started");
        while !shutdown.is_cancelled() {
            let idle = match self.poll_once().await {
                Ok(DispatchOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(task_type = %self.task_type, outcome = ?outcome, "task dispatched");
                    false
                }
                Err(err) => {
                    error!(task_type = %self.task_type, error = %err, "dispatch failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        info!(task_type = %self.task_type, "dispatcher stopped");
    }

    async fn process(&self, task: &Task) -> Result<DispatchOutcome, DispatchError> {
        let Some(handler) = self.registry.get(task.task_type()) else {
            let message = format!("no handler registered for task type {}", task.task_type());
            warn!(error = %message, "failing task without handler");
            let outcome = self.retry.fail_permanently(task, &message).await?;
            return Ok(Self::from_retry(task, outcome));
        };

        match self.invoke(handler, task).await {
            Ok(result) => self.apply_result(task, &result).await,
            Err(err) => {
                warn!(error = %err, class = ?err.class(), "handler failed");
                let outcome = self.retry.handle_task_failure(task, &err).await?;
                Ok(Self::from_retry(task, outcome))
            }
        }
    }

    async fn invoke(
        &self,
        handler: Arc<dyn TaskHandler>,
        task: &Task,
    ) -> Result<TaskResult, HandlerError> {
        let owned = task.clone();
        let mut call = tokio::spawn(
            async move { handler.handle(&owned, owned.payload()).await }.in_current_span(),
        );
        match tokio::time::timeout(self.config.handler_timeout, &mut call).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(HandlerError::Panicked(panic_message(join_err))),
            Err(_) => {
                call.abort();
                Err(HandlerError::Timeout(self.config.handler_timeout))
            }
        }
    }

    async fn apply_result(
        &self,
        task: &Task,
        result: &TaskResult,
    ) -> Result<DispatchOutcome, DispatchError> {
        match result.status() {
            TaskResultStatus::Completed => {
                let payload = task.payload().merged(result.metadata());
                let route = self.router.on_success(task.task_type(), &payload);
                let completed = TaskMutation::to(TaskStatus::Completed).for_claim(task.attempt());
                self.follow(task, result, route, completed, false).await
            }
            TaskResultStatus::Failed => {
                let payload = task.payload().merged(result.metadata());
                let message = failure_message(result);
                if let Some(route) = self.router.on_failure(task.task_type(), &payload, message) {
                    let completed = TaskMutation::to(TaskStatus::Completed)
                        .with_error(message)
                        .for_claim(task.attempt());
                    return self.follow(task, result, route, completed, true).await;
                }
                let outcome = self.retry.fail_permanently(task, message).await?;
                Ok(Self::from_retry(task, outcome))
            }
            TaskResultStatus::Retry => {
                let outcome = self
                    .retry
                    .retry_with_message(task, failure_message(result), result.retry_after())
                    .await?;
                Ok(Self::from_retry(task, outcome))
            }
        }
    }

    /// Completes `task` and applies `route` in one commit.
    async fn follow(
        &self,
        task: &Task,
        result: &TaskResult,
        route: Route,
        completed: TaskMutation,
        looped_back: bool,
    ) -> Result<DispatchOutcome, DispatchError> {
        match route {
            Route::Next { stage, payload } => {
                let next = self.queue().prepare_task(task.build_id(), stage, payload)?;
                let next_task_id = next.id();
                let transition = TaskTransition::new(completed).enqueuing(next);
                if self.commit(task, transition).await?.is_none() {
                    return Ok(Self::superseded(task));
                }
                if looped_back {
                    info!(next_task_id = %next_task_id, "looped back");
                    Ok(DispatchOutcome::LoopedBack {
                        task_id: task.id(),
                        next_task_id,
                    })
                } else {
                    Ok(DispatchOutcome::Advanced {
                        task_id: task.id(),
                        next_task_id,
                    })
                }
            }
            Route::Finish => {
                let status = result
                    .requested_build_status()
                    .unwrap_or(BuildStatus::Completed);
                let transition = TaskTransition::new(completed)
                    .moving_build(status, &[BuildStatus::Processing]);
                let Some(commit) = self.commit(task, transition).await? else {
                    return Ok(Self::superseded(task));
                };
                let build_status = match commit.build {
                    Some(BuildUpdate::Updated(build)) => Some(build.status()),
                    Some(BuildUpdate::Unchanged(_) | BuildUpdate::Missing) | None => None,
                };
                info!(build_status = ?build_status, "pipeline finished");
                Ok(DispatchOutcome::Finished {
                    task_id: task.id(),
                    build_status,
                })
            }
        }
    }

    /// Commits `transition`, yielding `None` when the claim was superseded.
    async fn commit(
        &self,
        task: &Task,
        transition: TaskTransition,
    ) -> Result<Option<TransitionCommit>, DispatchError> {
        match self.queue().commit_transition(task, transition).await {
            Ok(commit) => Ok(Some(commit)),
            Err(TaskQueueError::StaleClaim(reason)) => {
                warn!(reason = %reason, "result from a superseded claim discarded");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    const fn superseded(task: &Task) -> DispatchOutcome {
        DispatchOutcome::Superseded {
            task_id: task.id(),
            attempt: task.attempt(),
        }
    }

    fn from_retry(task: &Task, outcome: RetryOutcome) -> DispatchOutcome {
        let task_id = task.id();
        match outcome {
            RetryOutcome::Requeued { delay } => DispatchOutcome::Retrying { task_id, delay },
            RetryOutcome::Failed { escalation } => DispatchOutcome::Failed {
                task_id,
                escalation_id: escalation.map(|notify| notify.id()),
            },
            RetryOutcome::Superseded => Self::superseded(task),
        }
    }
}

fn failure_message(result: &TaskResult) -> &str {
    if result.message().trim().is_empty() {
        UNEXPLAINED_FAILURE
    } else {
        result.message()
    }
}

fn panic_message(err: JoinError) -> String {
    err.try_into_panic()
        .map_or_else(|cancelled| cancelled.to_string(), |payload| describe_panic(&*payload))
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_owned())
}

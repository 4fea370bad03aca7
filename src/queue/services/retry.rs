//! Failure classification, exponential backoff, and escalation.

use super::queue::{TaskQueueError, TaskQueueService};
use crate::queue::{
    domain::{BuildId, BuildStatus, Payload, Task, TaskId, TaskMutation, TaskStatus, TaskType},
    ports::{TaskStore, TaskTransition},
};
use mockable::Clock;
use rand::Rng;
use serde::Serialize;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Longest error description stored on a task, in characters.
pub const MAX_ERROR_MESSAGE_CHARS: usize = 1000;

/// Payload key naming the kind of notification an escalation carries.
pub const NOTIFICATION_TYPE_KEY: &str = "notification_type";

/// Notification kind used for terminal build failures.
pub const MANUAL_INTERVENTION: &str = "MANUAL_INTERVENTION";

/// Backoff configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry, doubled per attempt.
    pub base_delay: Duration,
    /// Upper bound on any computed delay.
    pub max_delay: Duration,
    /// Multiplicative jitter ratio in `[0, 1]`; `None` disables jitter.
    pub jitter: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            jitter: Some(0.2),
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, for tests and reproducible runs.
    #[must_use]
    pub fn deterministic() -> Self {
        Self {
            jitter: None,
            ..Self::default()
        }
    }

    /// Computes `min(base_delay * 2^attempt, max_delay)`, then applies
    /// jitter when enabled. The result never exceeds `max_delay`.
    #[must_use]
    pub fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        let exponential = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        match self.jitter {
            Some(ratio) if ratio > 0.0 => self.jittered(exponential, ratio),
            _ => exponential,
        }
    }

    #[expect(
        clippy::float_arithmetic,
        reason = "jitter is a multiplicative float factor applied to the delay"
    )]
    fn jittered(&self, delay: Duration, ratio: f64) -> Duration {
        let spread = ratio.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .map_or(self.max_delay, |jittered| jittered.min(self.max_delay))
    }
}

/// Failure category; decides whether another attempt can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Malformed input; never retried.
    Validation,
    /// Untrusted input or authorization failure; never retried.
    Security,
    /// External service or infrastructure failure.
    Transient,
    /// The handler exceeded its time budget or stalled.
    Timeout,
    /// The handler panicked.
    Panic,
    /// Anything else.
    Unknown,
}

impl FailureClass {
    /// Returns `true` when retrying could succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Validation | Self::Security)
    }
}

/// An error that knows its [`FailureClass`].
pub trait ClassifiedError: StdError + Send + Sync {
    /// Returns the failure category.
    fn failure_class(&self) -> FailureClass;
}

/// Describes an error as `"top (caused by: root)"`, truncated to
/// [`MAX_ERROR_MESSAGE_CHARS`].
#[must_use]
pub fn describe_failure(err: &(dyn StdError + 'static)) -> String {
    let top = err.to_string();
    let mut root = err.source();
    while let Some(next) = root.and_then(StdError::source) {
        root = Some(next);
    }
    let described = match root.map(ToString::to_string) {
        Some(cause) if cause != top => format!("{top} (caused by: {cause})"),
        _ => top,
    };
    truncate_message(&described)
}

/// Truncates `message` to [`MAX_ERROR_MESSAGE_CHARS`] characters.
#[must_use]
pub fn truncate_message(message: &str) -> String {
    message.chars().take(MAX_ERROR_MESSAGE_CHARS).collect()
}

/// Errors returned by the retry handler.
#[derive(Debug, Error)]
pub enum RetryError {
    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
}

/// Result type for retry handler operations.
pub type RetryResult<T> = Result<T, RetryError>;

/// What happened to a failed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// The task is `RETRY` and claimable again after `delay`.
    Requeued {
        /// Backoff applied.
        delay: Duration,
    },
    /// The task is terminally `FAILED`.
    Failed {
        /// Notification task enqueued for a human, when one was created.
        escalation: Option<Task>,
    },
    /// The task was reclaimed since the failing attempt started; nothing
    /// was written.
    Superseded,
}

/// Tasks requeued by a build-level retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRetrySummary {
    /// The retried build.
    pub build_id: BuildId,
    /// Tasks moved from `FAILED` back to `PENDING`.
    pub requeued: Vec<TaskId>,
}

/// Decides between backoff and terminal failure for failed tasks.
pub struct RetryHandler<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    queue: TaskQueueService<S, C>,
    policy: RetryPolicy,
}

impl<S, C> Clone for RetryHandler<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            policy: self.policy,
        }
    }
}

impl<S, C> RetryHandler<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    /// Creates a retry handler over `queue`.
    #[must_use]
    pub const fn new(queue: TaskQueueService<S, C>, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    /// Returns the backoff policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns the underlying queue service.
    #[must_use]
    pub const fn queue(&self) -> &TaskQueueService<S, C> {
        &self.queue
    }

    /// Computes the backoff delay for `attempt`.
    #[must_use]
    pub fn calculate_retry_delay(&self, attempt: u32) -> Duration {
        self.policy.calculate_retry_delay(attempt)
    }

    /// Routes a failed attempt by error class.
    ///
    /// Validation and security failures go straight to `FAILED`. Everything
    /// else is requeued with backoff while attempts remain.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when a queue operation fails.
    pub async fn handle_task_failure<E>(&self, task: &Task, err: &E) -> RetryResult<RetryOutcome>
    where
        E: ClassifiedError + 'static,
    {
        let class = err.failure_class();
        let message = describe_failure(err);
        if class.is_retryable() {
            self.retry_with_message(task, &message, None).await
        } else {
            warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                class = ?class,
                "non-retryable failure"
            );
            self.fail_permanently(task, &message).await
        }
    }

    /// Requeues a task with backoff, or fails it when attempts are exhausted.
    ///
    /// `delay_hint` overrides the computed backoff and is capped at the
    /// policy's `max_delay`. The first retry waits `base_delay`.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when a queue operation fails.
    pub async fn retry_with_message(
        &self,
        task: &Task,
        message: &str,
        delay_hint: Option<Duration>,
    ) -> RetryResult<RetryOutcome> {
        if !task.should_retry() {
            warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                attempt = task.attempt(),
                max_attempts = task.max_attempts(),
                "retries exhausted"
            );
            return self.fail_permanently(task, message).await;
        }

        let stored = truncate_message(message);
        let delay = delay_hint.map_or_else(
            || self.calculate_retry_delay(task.attempt().saturating_sub(1)),
            |hint| hint.min(self.policy.max_delay),
        );
        let mutation = TaskMutation::to(TaskStatus::Retry)
            .with_error(stored)
            .available_at(self.queue.available_after(delay));
        let transition = TaskTransition::new(fenced(task, mutation));
        match self.queue.commit_transition(task, transition).await {
            Ok(_) => {
                info!(
                    task_id = %task.id(),
                    build_id = %task.build_id(),
                    task_type = %task.task_type(),
                    attempt = task.attempt(),
                    delay_secs = delay.as_secs(),
                    "task requeued for retry"
                );
                Ok(RetryOutcome::Requeued { delay })
            }
            Err(err) => superseded(task, err),
        }
    }

    /// Fails a task regardless of remaining attempts, fails its build, and
    /// escalates.
    ///
    /// The task status, the build cascade, and the escalation task are
    /// committed together.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when a queue operation fails.
    pub async fn fail_permanently(&self, task: &Task, message: &str) -> RetryResult<RetryOutcome> {
        let stored = truncate_message(message);
        let mutation = TaskMutation::to(TaskStatus::Failed).with_error(stored.as_str());
        let mut transition = TaskTransition::new(fenced(task, mutation))
            .moving_build(BuildStatus::Failed, &[BuildStatus::Processing]);
        if task.task_type() != &TaskType::NOTIFY {
            let payload = escalation_payload(task, &stored);
            let escalation = self
                .queue
                .prepare_task(task.build_id(), TaskType::NOTIFY, payload)?;
            transition = transition.enqueuing(escalation);
        }

        let commit = match self.queue.commit_transition(task, transition).await {
            Ok(commit) => commit,
            Err(err) => return superseded(task, err),
        };
        match &commit.enqueued {
            Some(escalation) => warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                escalation_id = %escalation.id(),
                "task failed permanently; escalated"
            ),
            None => error!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                task_type = %task.task_type(),
                error = stored.as_str(),
                "notification task failed; not escalating"
            ),
        }
        Ok(RetryOutcome::Failed {
            escalation: commit.enqueued,
        })
    }

    /// Resets a `FAILED` task to `PENDING` and reopens its build.
    ///
    /// Returns `false` when the task is missing or not `FAILED`.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when a queue operation fails.
    pub async fn manual_retry(&self, task_id: TaskId) -> RetryResult<bool> {
        let Some(task) = self.queue.find_task(task_id).await? else {
            return Ok(false);
        };
        if !self.queue.reset_for_manual_retry(task_id).await? {
            return Ok(false);
        }
        self.reopen_build(task.build_id()).await?;
        Ok(true)
    }

    /// Resets every `FAILED` task of a build and reopens the build.
    ///
    /// Returns `None` when the build does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] when a queue operation fails.
    pub async fn retry_build(&self, build_id: BuildId) -> RetryResult<Option<BuildRetrySummary>> {
        if self.queue.find_build(build_id).await?.is_none() {
            return Ok(None);
        }
        let tasks = self
            .queue
            .store()
            .tasks_for_build(build_id)
            .await
            .map_err(TaskQueueError::from)?;

        let mut requeued = Vec::new();
        for task in tasks.iter().filter(|task| task.status() == TaskStatus::Failed) {
            if self.queue.reset_for_manual_retry(task.id()).await? {
                requeued.push(task.id());
            }
        }
        if !requeued.is_empty() {
            self.reopen_build(build_id).await?;
        }
        info!(build_id = %build_id, requeued = requeued.len(), "build retry requested");
        Ok(Some(BuildRetrySummary { build_id, requeued }))
    }

    async fn reopen_build(&self, build_id: BuildId) -> RetryResult<()> {
        self.queue
            .mark_build(build_id, BuildStatus::Processing, &[BuildStatus::Failed])
            .await?;
        Ok(())
    }
}

/// Binds `mutation` to the caller's claim when the task is held.
fn fenced(task: &Task, mutation: TaskMutation) -> TaskMutation {
    if task.status() == TaskStatus::InProgress {
        mutation.for_claim(task.attempt())
    } else {
        mutation
    }
}

fn escalation_payload(task: &Task, message: &str) -> Payload {
    task.payload().merged(
        &Payload::new()
            .with(NOTIFICATION_TYPE_KEY, MANUAL_INTERVENTION)
            .with("failed_task_id", task.id().to_string())
            .with("failed_stage", task.task_type().as_str())
            .with("error", message),
    )
}

fn superseded(task: &Task, err: TaskQueueError) -> RetryResult<RetryOutcome> {
    match err {
        TaskQueueError::StaleClaim(reason) => {
            warn!(
                task_id = %task.id(),
                build_id = %task.build_id(),
                attempt = task.attempt(),
                reason = %reason,
                "failure from a superseded claim discarded"
            );
            Ok(RetryOutcome::Superseded)
        }
        other => Err(other.into()),
    }
}

//! Task aggregate and the change sets applied to it by the queue.

use super::{BuildId, Payload, QueueDomainError, TaskId, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use mockable::Clock;
use serde::{Deserialize, Serialize};

/// Task aggregate: one unit of pipeline work with its own retry budget.
///
/// Status, attempt, and error are changed only through [`Task::claim`] and
/// [`Task::apply`], which enforce the task state machine and the
/// `0 <= attempt <= max_attempts` invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    build_id: BuildId,
    task_type: TaskType,
    status: TaskStatus,
    attempt: u32,
    max_attempts: u32,
    payload: Payload,
    error_message: Option<String>,
    available_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Parameter object for reconstructing a persisted task aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTaskData {
    /// Persisted task identifier.
    pub id: TaskId,
    /// Owning build.
    pub build_id: BuildId,
    /// Pipeline stage.
    pub task_type: TaskType,
    /// Persisted lifecycle status.
    pub status: TaskStatus,
    /// Attempts consumed so far.
    pub attempt: u32,
    /// Attempt budget.
    pub max_attempts: u32,
    /// Accumulated stage payload.
    pub payload: Payload,
    /// Latest failure description, if any.
    pub error_message: Option<String>,
    /// Earliest claim time for a task waiting on backoff.
    pub available_at: Option<DateTime<Utc>>,
    /// Persisted creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Persisted latest update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Attempt budget used when none is configured.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Creates a pending task with no attempts consumed.
    #[must_use]
    pub fn new(
        build_id: BuildId,
        task_type: TaskType,
        payload: Payload,
        clock: &impl Clock,
    ) -> Self {
        let timestamp = clock.utc();
        Self {
            id: TaskId::new(),
            build_id,
            task_type,
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            payload,
            error_message: None,
            available_at: None,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    /// Overrides the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError::InvalidMaxAttempts`] when `max_attempts`
    /// is zero.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, QueueDomainError> {
        if max_attempts == 0 {
            return Err(QueueDomainError::InvalidMaxAttempts(max_attempts));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    /// Reconstructs a task from persisted storage.
    #[must_use]
    pub fn from_persisted(data: PersistedTaskData) -> Self {
        Self {
            id: data.id,
            build_id: data.build_id,
            task_type: data.task_type,
            status: data.status,
            attempt: data.attempt,
            max_attempts: data.max_attempts,
            payload: data.payload,
            error_message: data.error_message,
            available_at: data.available_at,
            created_at: data.created_at,
            updated_at: data.updated_at,
        }
    }

    /// Returns the task identifier.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    /// Returns the owning build identifier.
    #[must_use]
    pub const fn build_id(&self) -> BuildId {
        self.build_id
    }

    /// Returns the pipeline stage.
    #[must_use]
    pub const fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    /// Returns the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Returns the number of attempts consumed.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the attempt budget.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the accumulated stage payload.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the latest failure description.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Returns the earliest time a retrying task may be claimed again.
    #[must_use]
    pub const fn available_at(&self) -> Option<DateTime<Utc>> {
        self.available_at
    }

    /// Returns the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns the latest update timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns `true` while the attempt budget is not exhausted.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Returns `true` when a worker may claim the task at `now`.
    #[must_use]
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        let due = match self.status {
            TaskStatus::Pending => true,
            TaskStatus::Retry => self.available_at.is_none_or(|at| at <= now),
            TaskStatus::InProgress | TaskStatus::Completed | TaskStatus::Failed => false,
        };
        due && self.should_retry()
    }

    /// Claims the task for a worker: `IN_PROGRESS` and one more attempt.
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError::InvalidTaskTransition`] when the task is not
    /// claimable or its attempt budget is exhausted.
    pub fn claim(&mut self, now: DateTime<Utc>) -> Result<(), QueueDomainError> {
        if !self.status.is_claimable() || !self.should_retry() {
            return Err(self.rejected(TaskStatus::InProgress));
        }
        self.status = TaskStatus::InProgress;
        self.attempt = self.attempt.saturating_add(1);
        self.available_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Applies a status change set.
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError::InvalidTaskTransition`] when the state
    /// machine does not allow moving to the requested status.
    ///
    /// Returns [`QueueDomainError::StaleClaim`] when the mutation is bound to
    /// a claim the task no longer holds.
    pub fn apply(
        &mut self,
        mutation: &TaskMutation,
        now: DateTime<Utc>,
    ) -> Result<(), QueueDomainError> {
        if let Some(claimed_attempt) = mutation
            .claimed_attempt
            .filter(|attempt| !self.is_held_by(*attempt))
        {
            return Err(QueueDomainError::StaleClaim {
                task_id: self.id,
                claimed_attempt,
                current_attempt: self.attempt,
                status: self.status,
            });
        }
        if !self.status.can_transition_to(mutation.status) {
            return Err(self.rejected(mutation.status));
        }
        self.status = mutation.status;
        match &mutation.error {
            ErrorUpdate::Keep => {}
            ErrorUpdate::Set(message) => self.error_message = Some(message.clone()),
            ErrorUpdate::Clear => self.error_message = None,
        }
        if mutation.reset_attempts {
            self.attempt = 0;
        }
        self.available_at = mutation.available_at;
        self.updated_at = now;
        Ok(())
    }

    /// Returns `true` while the claim made at `attempt` still owns the task.
    #[must_use]
    pub fn is_held_by(&self, attempt: u32) -> bool {
        self.status == TaskStatus::InProgress && self.attempt == attempt
    }

    const fn rejected(&self, to: TaskStatus) -> QueueDomainError {
        QueueDomainError::InvalidTaskTransition {
            task_id: self.id,
            from: self.status,
            to,
        }
    }
}

/// How a [`TaskMutation`] treats the stored error message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorUpdate {
    /// Leave the stored message untouched.
    Keep,
    /// Replace the stored message.
    Set(String),
    /// Remove the stored message.
    Clear,
}

/// Status, error, attempt, and availability written together in one store
/// operation.
///
/// A mutation bound to a claim with [`TaskMutation::for_claim`] is applied
/// only while that claim still owns the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMutation {
    status: TaskStatus,
    error: ErrorUpdate,
    reset_attempts: bool,
    available_at: Option<DateTime<Utc>>,
    claimed_attempt: Option<u32>,
}

impl TaskMutation {
    /// Starts a change set targeting `status`.
    #[must_use]
    pub const fn to(status: TaskStatus) -> Self {
        Self {
            status,
            error: ErrorUpdate::Keep,
            reset_attempts: false,
            available_at: None,
            claimed_attempt: None,
        }
    }

    /// Stores `message` as the task error.
    #[must_use]
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = ErrorUpdate::Set(message.into());
        self
    }

    /// Clears the stored task error.
    #[must_use]
    pub fn clearing_error(mut self) -> Self {
        self.error = ErrorUpdate::Clear;
        self
    }

    /// Resets the attempt counter to zero.
    #[must_use]
    pub const fn resetting_attempts(mut self) -> Self {
        self.reset_attempts = true;
        self
    }

    /// Delays the next claim until `at`.
    #[must_use]
    pub const fn available_at(mut self, at: DateTime<Utc>) -> Self {
        self.available_at = Some(at);
        self
    }

    /// Binds the change to the claim made at `attempt`.
    #[must_use]
    pub const fn for_claim(mut self, attempt: u32) -> Self {
        self.claimed_attempt = Some(attempt);
        self
    }

    /// Returns the claim attempt this change is bound to, if any.
    #[must_use]
    pub const fn claimed_attempt(&self) -> Option<u32> {
        self.claimed_attempt
    }

    /// Returns the target status.
    #[must_use]
    pub const fn status(&self) -> TaskStatus {
        self.status
    }

    /// Returns the error update.
    #[must_use]
    pub const fn error(&self) -> &ErrorUpdate {
        &self.error
    }
}

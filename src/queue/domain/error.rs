//! Error types for queue domain validation and parsing.

use super::{BuildId, BuildStatus, TaskId, TaskStatus};
use thiserror::Error;

/// Errors returned while constructing or mutating queue domain values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueDomainError {
    /// The job name is empty or too long.
    #[error("invalid job name '{0}'")]
    InvalidJobName(String),

    /// The build number is outside the supported range.
    #[error("invalid build number {0}, expected a positive integer")]
    InvalidBuildNumber(u64),

    /// The task type tag is not an upper-case identifier.
    #[error("invalid task type '{0}', expected an upper-case identifier")]
    InvalidTaskType(String),

    /// The retry budget must allow at least one attempt.
    #[error("invalid max attempts {0}, expected at least 1")]
    InvalidMaxAttempts(u32),

    /// The requested task status change is not part of the task state machine.
    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTaskTransition {
        /// Task whose status change was rejected.
        task_id: TaskId,
        /// Current task status.
        from: TaskStatus,
        /// Requested task status.
        to: TaskStatus,
    },

    /// A change was reported by a claim that no longer owns the task.
    #[error(
        "task {task_id} is no longer held by attempt {claimed_attempt} \
         (now {status} at attempt {current_attempt})"
    )]
    StaleClaim {
        /// Task the change targeted.
        task_id: TaskId,
        /// Attempt the reporting worker claimed.
        claimed_attempt: u32,
        /// Attempt currently recorded on the task.
        current_attempt: u32,
        /// Current task status.
        status: TaskStatus,
    },

    /// The requested build status change is not permitted.
    #[error("build {build_id} cannot move from {from} to {to}")]
    InvalidBuildTransition {
        /// Build whose status change was rejected.
        build_id: BuildId,
        /// Current build status.
        from: BuildStatus,
        /// Requested build status.
        to: BuildStatus,
    },
}

/// Error returned while parsing task statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown task status: {0}")]
pub struct ParseTaskStatusError(pub String);

/// Error returned while parsing build statuses from persistence.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown build status: {0}")]
pub struct ParseBuildStatusError(pub String);

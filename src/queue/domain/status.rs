//! Build and task lifecycle states plus the extensible task type tag.

use super::{ParseBuildStatusError, ParseTaskStatusError, QueueDomainError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Build remediation lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    /// The pipeline is still working on the build.
    Processing,
    /// A fix was produced and delivered.
    Fixed,
    /// The final stage finished successfully.
    Completed,
    /// A stage failed terminally and a human was notified.
    Failed,
    /// The build was cancelled externally.
    Cancelled,
}

impl BuildStatus {
    /// Every build status, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Processing,
        Self::Fixed,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "PROCESSING",
            Self::Fixed => "FIXED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Returns `true` when no further pipeline work applies to the build.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Processing)
    }

    /// Returns `true` for the successful terminal states.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Fixed | Self::Completed)
    }
}

impl TryFrom<&str> for BuildStatus {
    type Error = ParseBuildStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "PROCESSING" => Ok(Self::Processing),
            "FIXED" => Ok(Self::Fixed),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(ParseBuildStatusError(value.to_owned())),
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Freshly enqueued and waiting for a worker.
    Pending,
    /// Claimed by exactly one worker.
    InProgress,
    /// Failed retryably and waiting for its backoff to elapse.
    Retry,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; only a manual retry reopens it.
    Failed,
}

impl TaskStatus {
    /// Every task status, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Retry,
        Self::Completed,
        Self::Failed,
    ];

    /// Returns the canonical storage representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Retry => "RETRY",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// Returns `true` for states that end the task lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` for states a worker may claim from.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Pending | Self::Retry)
    }

    /// Returns `true` when moving from `self` to `target` is permitted.
    ///
    /// Terminal self-transitions are accepted so that repeated writes after a
    /// crash stay harmless.
    #[must_use]
    pub const fn can_transition_to(self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending | Self::Retry, Self::InProgress)
                | (
                    Self::InProgress,
                    Self::Completed | Self::Retry | Self::Failed | Self::Pending
                )
                | (Self::Failed, Self::Pending)
                | (Self::Completed, Self::Completed)
                | (Self::Failed, Self::Failed)
        )
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = ParseTaskStatusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let normalized = value.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "RETRY" => Ok(Self::Retry),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            _ => Err(ParseTaskStatusError(value.to_owned())),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage a task belongs to.
///
/// The set is open: the well-known stages are exposed as constants and new
/// stages can be created with [`TaskType::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskType(Cow<'static, str>);

impl TaskType {
    /// Classify the failure and plan the fix.
    pub const PLAN: Self = Self(Cow::Borrowed("PLAN"));
    /// Retrieve candidate source files.
    pub const RETRIEVE: Self = Self(Cow::Borrowed("RETRIEVE"));
    /// Generate a patch.
    pub const PATCH: Self = Self(Cow::Borrowed("PATCH"));
    /// Compile and test the patch.
    pub const VALIDATE: Self = Self(Cow::Borrowed("VALIDATE"));
    /// Open a pull request.
    pub const PR: Self = Self(Cow::Borrowed("PR"));
    /// Notify stakeholders.
    pub const NOTIFY: Self = Self(Cow::Borrowed("NOTIFY"));

    /// Longest task type the `tasks.type` column accepts.
    pub const MAX_LENGTH: usize = 64;

    /// Creates a validated task type, normalizing to upper case.
    ///
    /// # Errors
    ///
    /// Returns [`QueueDomainError::InvalidTaskType`] when the value is empty,
    /// too long, or contains characters other than ASCII letters, digits, and
    /// underscores.
    pub fn new(value: impl AsRef<str>) -> Result<Self, QueueDomainError> {
        let raw = value.as_ref();
        let normalized = raw.trim().to_ascii_uppercase();
        let is_valid = !normalized.is_empty()
            && normalized.len() <= Self::MAX_LENGTH
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit() || ch == '_');
        if !is_valid {
            return Err(QueueDomainError::InvalidTaskType(raw.to_owned()));
        }
        Ok(Self(Cow::Owned(normalized)))
    }

    /// Returns the canonical storage representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskType {
    type Error = QueueDomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0.into_owned()
    }
}

impl AsRef<str> for TaskType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//! Ephemeral outcome a stage handler reports for one task attempt.

use super::{BuildStatus, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Outcome category of a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// The stage finished; the pipeline advances.
    Completed,
    /// The stage cannot succeed; no further attempt is made.
    Failed,
    /// The stage asks to be attempted again.
    Retry,
}

/// Handler outcome. Never persisted on its own; its metadata is merged into
/// the payload of whatever task the dispatcher creates next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    status: TaskResultStatus,
    message: String,
    metadata: Payload,
}

impl TaskResult {
    /// Metadata key holding a retry delay override in whole seconds.
    pub const RETRY_AFTER_SECONDS_KEY: &'static str = "retry_after_seconds";

    /// Metadata key selecting the terminal build status on the final stage.
    pub const BUILD_STATUS_KEY: &'static str = "build_status";

    /// Creates a successful result.
    #[must_use]
    pub fn completed(message: impl Into<String>) -> Self {
        Self::with_status(TaskResultStatus::Completed, message)
    }

    /// Creates a permanent failure result.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::with_status(TaskResultStatus::Failed, message)
    }

    /// Creates a result asking for another attempt.
    #[must_use]
    pub fn retry(message: impl Into<String>) -> Self {
        Self::with_status(TaskResultStatus::Retry, message)
    }

    fn with_status(status: TaskResultStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            metadata: Payload::new(),
        }
    }

    /// Adds one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key, value);
        self
    }

    /// Replaces the metadata document.
    #[must_use]
    pub fn with_metadata_payload(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets an explicit retry delay hint.
    #[must_use]
    pub fn with_retry_after(self, delay: Duration) -> Self {
        self.with_metadata(Self::RETRY_AFTER_SECONDS_KEY, delay.as_secs())
    }

    /// Returns the outcome category.
    #[must_use]
    pub const fn status(&self) -> TaskResultStatus {
        self.status
    }

    /// Returns the human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the metadata document.
    #[must_use]
    pub const fn metadata(&self) -> &Payload {
        &self.metadata
    }

    /// Returns the retry delay requested by the handler, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.metadata
            .get_u64(Self::RETRY_AFTER_SECONDS_KEY)
            .map(Duration::from_secs)
    }

    /// Returns the terminal build status requested by the handler, if it is a
    /// success state.
    #[must_use]
    pub fn requested_build_status(&self) -> Option<BuildStatus> {
        self.metadata
            .get_str(Self::BUILD_STATUS_KEY)
            .and_then(|raw| BuildStatus::try_from(raw).ok())
            .filter(|status| status.is_success())
    }
}

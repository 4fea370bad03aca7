//! Stage handler contract.

use crate::queue::{
    domain::{Payload, Task, TaskResult},
    services::{ClassifiedError, FailureClass},
};
use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Result type returned by stage handlers.
pub type HandlerResult = Result<TaskResult, HandlerError>;

/// Work performed for one pipeline stage.
///
/// Implementations are registered under exactly one task type. The payload
/// carries everything accumulated by earlier stages; handlers validate the
/// keys they read.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Runs one attempt of `task`.
    async fn handle(&self, task: &Task, payload: &Payload) -> HandlerResult;
}

/// Failures a handler raises instead of returning a [`TaskResult`].
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload or upstream artifact is malformed.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The input is untrusted or the handler lacked authorization.
    #[error("security check failed: {0}")]
    Security(String),
    /// An external service or subprocess failed.
    #[error("{message}")]
    Transient {
        /// Description of the failed operation.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<Box<dyn StdError + Send + Sync>>,
    },
    /// The handler exceeded its time budget.
    #[error("handler timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// Any other failure.
    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    /// Builds a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Builds a security failure.
    pub fn security(message: impl Into<String>) -> Self {
        Self::Security(message.into())
    }

    /// Builds a transient failure without a cause.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            source: None,
        }
    }

    /// Builds a transient failure caused by `err`.
    pub fn transient_caused_by(
        message: impl Into<String>,
        err: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Transient {
            message: message.into(),
            source: Some(Box::new(err)),
        }
    }

    /// Wraps an unclassified error.
    pub fn other(err: impl StdError + Send + Sync + 'static) -> Self {
        Self::Other(Box::new(err))
    }

    /// Returns the failure category the retry handler acts on.
    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Validation(_) => FailureClass::Validation,
            Self::Security(_) => FailureClass::Security,
            Self::Transient { .. } => FailureClass::Transient,
            Self::Timeout(_) => FailureClass::Timeout,
            Self::Panicked(_) => FailureClass::Panic,
            Self::Other(_) => FailureClass::Unknown,
        }
    }
}

impl ClassifiedError for HandlerError {
    fn failure_class(&self) -> FailureClass {
        self.class()
    }
}

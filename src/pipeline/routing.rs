//! Next-stage decisions after a task finishes.
//!
//! The dispatcher never hardcodes the stage graph. It asks a [`StageRouter`]
//! what follows a stage, so new stages and branch points only touch the
//! router configuration.

use crate::queue::domain::{Payload, TaskType};
use serde_json::{Map, Value};
use thiserror::Error;

/// Payload key holding per-stage loop-back counters.
pub const LOOP_BACKS_KEY: &str = "loop_backs";

/// Payload key holding the failure that triggered the latest loop-back.
pub const LAST_FAILURE_KEY: &str = "last_failure";

/// What the dispatcher does after a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Enqueue `stage` for the same build with `payload`.
    Next {
        /// Stage to run next.
        stage: TaskType,
        /// Payload handed to the next stage.
        payload: Payload,
    },
    /// The build is done; move it to its success status.
    Finish,
}

/// Pluggable next-stage policy keyed by the finished stage and its outcome.
pub trait StageRouter: Send + Sync {
    /// Route taken after `stage` completes. `payload` already has the
    /// handler's metadata merged in.
    fn on_success(&self, stage: &TaskType, payload: &Payload) -> Route;

    /// Route taken after `stage` reports a permanent failure.
    ///
    /// `None` fails the build and escalates.
    fn on_failure(&self, stage: &TaskType, payload: &Payload, message: &str) -> Option<Route>;
}

/// Errors raised while configuring a [`LinearPipeline`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    /// The pipeline has no stages.
    #[error("pipeline must contain at least one stage")]
    EmptyPipeline,
    /// A stage appears twice.
    #[error("stage {0} appears more than once")]
    DuplicateStage(TaskType),
    /// A loop-back names a stage missing from the pipeline.
    #[error("stage {0} is not part of the pipeline")]
    UnknownStage(TaskType),
    /// A loop-back target does not precede its source.
    #[error("loop-back from {from} must target an earlier stage, not {to}")]
    ForwardLoopBack {
        /// Stage whose failure loops back.
        from: TaskType,
        /// Requested target stage.
        to: TaskType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopBack {
    from: TaskType,
    to: TaskType,
    max_loops: u64,
}

/// Ordered stages with optional bounded loop-backs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearPipeline {
    stages: Vec<TaskType>,
    loop_backs: Vec<LoopBack>,
}

impl Default for LinearPipeline {
    fn default() -> Self {
        Self {
            stages: vec![
                TaskType::PLAN,
                TaskType::RETRIEVE,
                TaskType::PATCH,
                TaskType::VALIDATE,
                TaskType::PR,
                TaskType::NOTIFY,
            ],
            loop_backs: Vec::new(),
        }
    }
}

impl LinearPipeline {
    /// Creates a pipeline running `stages` in order.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] when `stages` is empty or repeats a stage.
    pub fn new(stages: impl IntoIterator<Item = TaskType>) -> Result<Self, RoutingError> {
        let mut ordered: Vec<TaskType> = Vec::new();
        for stage in stages {
            if ordered.contains(&stage) {
                return Err(RoutingError::DuplicateStage(stage));
            }
            ordered.push(stage);
        }
        if ordered.is_empty() {
            return Err(RoutingError::EmptyPipeline);
        }
        Ok(Self {
            stages: ordered,
            loop_backs: Vec::new(),
        })
    }

    /// Routes permanent failures of `from` back to the earlier stage `to`,
    /// at most `max_loops` times per build.
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError`] when either stage is missing or `to` does
    /// not precede `from`.
    pub fn with_loop_back(
        mut self,
        from: TaskType,
        to: TaskType,
        max_loops: u64,
    ) -> Result<Self, RoutingError> {
        let from_index = self.position(&from)?;
        let to_index = self.position(&to)?;
        if to_index >= from_index {
            return Err(RoutingError::ForwardLoopBack { from, to });
        }
        self.loop_backs.retain(|existing| existing.from != from);
        self.loop_backs.push(LoopBack {
            from,
            to,
            max_loops,
        });
        Ok(self)
    }

    /// Returns the stage every build starts with.
    #[must_use]
    pub fn first_stage(&self) -> Option<&TaskType> {
        self.stages.first()
    }

    /// Returns the stages in order.
    #[must_use]
    pub fn stages(&self) -> &[TaskType] {
        &self.stages
    }

    /// Returns the stage after `stage`, if any.
    #[must_use]
    pub fn next_after(&self, stage: &TaskType) -> Option<&TaskType> {
        let index = self.stages.iter().position(|known| known == stage)?;
        self.stages.get(index.saturating_add(1))
    }

    fn position(&self, stage: &TaskType) -> Result<usize, RoutingError> {
        self.stages
            .iter()
            .position(|known| known == stage)
            .ok_or_else(|| RoutingError::UnknownStage(stage.clone()))
    }
}

/// Returns how often `stage` has already looped back within `payload`.
#[must_use]
pub fn loop_count(payload: &Payload, stage: &TaskType) -> u64 {
    payload
        .get(LOOP_BACKS_KEY)
        .and_then(|counters| counters.get(stage.as_str()))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

impl StageRouter for LinearPipeline {
    fn on_success(&self, stage: &TaskType, payload: &Payload) -> Route {
        self.next_after(stage).map_or(Route::Finish, |next| Route::Next {
            stage: next.clone(),
            payload: payload.clone(),
        })
    }

    fn on_failure(&self, stage: &TaskType, payload: &Payload, message: &str) -> Option<Route> {
        let loop_back = self.loop_backs.iter().find(|rule| &rule.from == stage)?;
        let used = loop_count(payload, stage);
        if used >= loop_back.max_loops {
            return None;
        }

        let mut counters = payload
            .get(LOOP_BACKS_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        counters.insert(stage.as_str().to_owned(), Value::from(used.saturating_add(1)));
        let mut failure = Map::new();
        failure.insert("stage".to_owned(), Value::from(stage.as_str()));
        failure.insert("message".to_owned(), Value::from(message));

        let next_payload = payload
            .clone()
            .with(LOOP_BACKS_KEY, Value::Object(counters))
            .with(LAST_FAILURE_KEY, Value::Object(failure));
        Some(Route::Next {
            stage: loop_back.to.clone(),
            payload: next_payload,
        })
    }
}

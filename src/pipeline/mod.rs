//! Multi-stage orchestration on top of the task queue.
//!
//! A [`TaskHandler`] implements one stage and is registered in a
//! [`HandlerRegistry`]. A [`StageDispatcher`] per task type claims work,
//! invokes the handler under a timeout, and asks a [`StageRouter`] what
//! comes next. The [`Orchestrator`] runs the dispatchers and stale task
//! reconciliation together under one shutdown token.

mod dispatcher;
mod handler;
mod orchestrator;
mod registry;
mod routing;

pub use dispatcher::{DispatchError, DispatchOutcome, DispatcherConfig, StageDispatcher};
#[cfg(test)]
pub use handler::MockTaskHandler;
pub use handler::{HandlerError, HandlerResult, TaskHandler};
pub use orchestrator::{Orchestrator, ReconcileSettings};
pub use registry::{HandlerRegistry, RegistryError};
pub use routing::{
    LAST_FAILURE_KEY, LOOP_BACKS_KEY, LinearPipeline, Route, RoutingError, StageRouter, loop_count,
};

#[cfg(test)]
mod tests;

//! Buildfix: task queue and stage orchestration for automated CI build
//! remediation.
//!
//! A failed CI build is submitted as a [`queue::domain::Build`] and driven
//! through an ordered pipeline of stage tasks. Workers claim tasks from a
//! durable queue, run the registered handler, and either advance the build
//! or route the failure through classified retry and escalation.
//!
//! # Architecture
//!
//! Buildfix follows hexagonal architecture principles:
//!
//! - **Domain**: Build and task state machines with no infrastructure dependencies
//! - **Ports**: The [`queue::ports::TaskStore`] contract
//! - **Adapters**: In-memory and `PostgreSQL` stores
//!
//! # Modules
//!
//! - [`queue`]: Durable queue, retry handler, and stale task reconciler
//! - [`pipeline`]: Stage handlers, routing, dispatchers, and the orchestrator
//! - [`admin`]: Operational HTTP surface
//! - [`config`]: Environment-driven settings
//! - [`telemetry`]: Tracing subscriber installation

pub mod admin;
pub mod config;
pub mod pipeline;
pub mod queue;
pub mod telemetry;

#[cfg(test)]
mod test_support;

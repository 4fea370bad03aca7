//! Durable build and task queue for CI build remediation.
//!
//! Builds own an ordered set of stage tasks. Workers claim tasks with
//! skip-locked semantics, and failures go through classified retry with
//! exponential backoff before escalating to a human. The module follows
//! hexagonal architecture:
//!
//! - Domain types in [`domain`]
//! - Port contracts in [`ports`]
//! - Adapter implementations in [`adapters`]
//! - Queue, retry, and reconciliation services in [`services`]

pub mod adapters;
pub mod domain;
pub mod ports;
pub mod services;

#[cfg(test)]
mod tests;

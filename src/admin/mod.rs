//! Operational HTTP surface for inspecting and recovering the queue.
//!
//! [`AdminService`] holds the read and manual-retry operations; [`router`]
//! exposes them as JSON endpoints under `/admin`.

mod routes;
mod service;

pub use routes::router;
pub use service::{
    AdminError, AdminResult, AdminService, AdminStatus, DEFAULT_PENDING_THRESHOLD, HealthReport,
    HealthStatus, ManualRetry,
};

#[cfg(test)]
mod tests;

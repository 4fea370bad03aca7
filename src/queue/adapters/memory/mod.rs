//! In-memory adapters for the build remediation queue.

mod store;

pub use store::InMemoryTaskStore;

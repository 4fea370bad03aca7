//! Port contracts for the build remediation queue.
//!
//! Ports define infrastructure-agnostic interfaces used by queue services.

pub mod store;

pub use store::{
    BuildChange, BuildUpdate, CompletionStat, Page, PageRequest, QueueStats, StatusCount,
    StoreHealth, TaskQuery, TaskStore, TaskStoreError, TaskStoreResult, TaskTransition,
    TaskTypeStatusCount, TransitionCommit,
};

//! Domain model for the build remediation queue.
//!
//! Builds own tasks; tasks move through the claim/retry state machine. All
//! infrastructure concerns stay outside this boundary.

mod build;
mod error;
mod ids;
mod payload;
mod result;
mod status;
mod task;

pub use build::{Build, BuildSubmission, PersistedBuildData};
pub use error::{ParseBuildStatusError, ParseTaskStatusError, QueueDomainError};
pub use ids::{BuildId, BuildNumber, JobName, TaskId};
pub use payload::Payload;
pub use result::{TaskResult, TaskResultStatus};
pub use status::{BuildStatus, TaskStatus, TaskType};
pub use task::{ErrorUpdate, PersistedTaskData, Task, TaskMutation};

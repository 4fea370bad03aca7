//! Application services for queueing, retrying, and reconciling tasks.

mod queue;
mod reconcile;
mod retry;

pub use queue::{SubmittedBuild, TaskQueueError, TaskQueueResult, TaskQueueService};
pub use reconcile::{ReconcileReport, StaleTaskReconciler, StalledTask};
pub use retry::{
    BuildRetrySummary, ClassifiedError, FailureClass, MANUAL_INTERVENTION,
    MAX_ERROR_MESSAGE_CHARS, NOTIFICATION_TYPE_KEY, RetryError, RetryHandler, RetryOutcome,
    RetryPolicy, RetryResult, describe_failure, truncate_message,
};

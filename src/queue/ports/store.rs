//! Task store port: durable builds and tasks with atomic claim semantics.

use crate::queue::domain::{
    Build, BuildId, BuildNumber, BuildStatus, JobName, QueueDomainError, Task, TaskId,
    TaskMutation, TaskStatus, TaskType,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Result type for task store operations.
pub type TaskStoreResult<T> = Result<T, TaskStoreError>;

/// Durable store shared by every worker.
///
/// Each method is one atomic operation; implementations must never let two
/// concurrent [`TaskStore::claim_next`] calls return the same task.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Stores a new build together with its first task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::DuplicateBuild`] when the (job, build number)
    /// pair already exists.
    async fn insert_build(&self, build: &Build, first_task: &Task) -> TaskStoreResult<()>;

    /// Stores a new task for an existing build.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::BuildNotFound`] when the owning build does
    /// not exist or [`TaskStoreError::DuplicateTask`] when the ID is taken.
    async fn insert_task(&self, task: &Task) -> TaskStoreResult<()>;

    /// Atomically claims the oldest eligible task of `task_type`.
    ///
    /// Eligible tasks are `PENDING`, or `RETRY` whose backoff has elapsed at
    /// `now`, with attempts remaining. The claimed task is returned already in
    /// `IN_PROGRESS` with its attempt incremented. Rows locked by another
    /// caller are skipped, never waited on. Returns `None` when nothing is
    /// eligible.
    async fn claim_next(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>>;

    /// Applies `mutation` to a task in one write.
    ///
    /// Returns `None` when the task no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::InvalidTransition`] when the task state
    /// machine rejects the change.
    async fn update_task(
        &self,
        id: TaskId,
        mutation: &TaskMutation,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>>;

    /// Applies `transition` as one unit: the task mutation, the optional
    /// build status change, and the optional follow-up task either all land
    /// or none do.
    ///
    /// Returns `None` when the task no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`TaskStoreError::InvalidTransition`] when the task state
    /// machine or the claim fence rejects the mutation, and
    /// [`TaskStoreError::DuplicateTask`] when the follow-up ID is taken. No
    /// write is kept on error.
    async fn commit_transition(
        &self,
        id: TaskId,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<TransitionCommit>>;

    /// Moves a build to `status` if its current status is in `only_from`.
    async fn update_build_status(
        &self,
        id: BuildId,
        status: BuildStatus,
        only_from: &[BuildStatus],
        now: DateTime<Utc>,
    ) -> TaskStoreResult<BuildUpdate>;

    /// Finds a task by identifier.
    async fn find_task(&self, id: TaskId) -> TaskStoreResult<Option<Task>>;

    /// Finds a build by identifier.
    async fn find_build(&self, id: BuildId) -> TaskStoreResult<Option<Build>>;

    /// Lists tasks matching `query`, oldest first.
    async fn list_tasks(
        &self,
        query: &TaskQuery,
        page: PageRequest,
    ) -> TaskStoreResult<Page<Task>>;

    /// Lists builds, newest first.
    async fn list_builds(&self, page: PageRequest) -> TaskStoreResult<Page<Build>>;

    /// Returns every task of a build, oldest first.
    async fn tasks_for_build(&self, build_id: BuildId) -> TaskStoreResult<Vec<Task>>;

    /// Counts tasks per status.
    async fn task_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<TaskStatus>>>;

    /// Counts builds per status.
    async fn build_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<BuildStatus>>>;

    /// Counts tasks per (type, status) and averages completion time per type.
    async fn queue_stats(&self) -> TaskStoreResult<QueueStats>;

    /// Returns `IN_PROGRESS` tasks last touched before `cutoff`.
    async fn find_stale_in_progress(&self, cutoff: DateTime<Utc>) -> TaskStoreResult<Vec<Task>>;

    /// Reports connection pool health.
    async fn health(&self) -> TaskStoreResult<StoreHealth>;
}

/// Outcome of a conditional build status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildUpdate {
    /// The status changed.
    Updated(Build),
    /// The current status was not eligible; the build is returned unchanged.
    Unchanged(Build),
    /// The build does not exist.
    Missing,
}

/// A conditional build status change carried by a [`TaskTransition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChange {
    /// Requested build status.
    pub status: BuildStatus,
    /// Statuses the build may currently be in for the change to apply.
    pub only_from: Vec<BuildStatus>,
}

/// A task mutation plus the writes that must land with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTransition {
    mutation: TaskMutation,
    enqueue: Option<Task>,
    build: Option<BuildChange>,
}

impl TaskTransition {
    /// Starts a transition that only mutates the task.
    #[must_use]
    pub const fn new(mutation: TaskMutation) -> Self {
        Self {
            mutation,
            enqueue: None,
            build: None,
        }
    }

    /// Inserts `task` in the same unit of work.
    #[must_use]
    pub fn enqueuing(mut self, task: Task) -> Self {
        self.enqueue = Some(task);
        self
    }

    /// Moves the owning build to `status` when it is in one of `only_from`.
    #[must_use]
    pub fn moving_build(mut self, status: BuildStatus, only_from: &[BuildStatus]) -> Self {
        self.build = Some(BuildChange {
            status,
            only_from: only_from.to_vec(),
        });
        self
    }

    /// Returns the task mutation.
    #[must_use]
    pub const fn mutation(&self) -> &TaskMutation {
        &self.mutation
    }

    /// Returns the follow-up task, if any.
    #[must_use]
    pub const fn enqueue(&self) -> Option<&Task> {
        self.enqueue.as_ref()
    }

    /// Returns the build status change, if any.
    #[must_use]
    pub const fn build_change(&self) -> Option<&BuildChange> {
        self.build.as_ref()
    }
}

/// What a committed [`TaskTransition`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionCommit {
    /// The task after its mutation.
    pub task: Task,
    /// The follow-up task as inserted.
    pub enqueued: Option<Task>,
    /// Result of the build status change, when one was requested.
    pub build: Option<BuildUpdate>,
}

/// Filter for task inspection queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskQuery {
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
    /// Restrict to one build.
    pub build_id: Option<BuildId>,
}

impl TaskQuery {
    /// Returns `true` when `task` satisfies the filter.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|status| task.status() == status)
            && self.build_id.is_none_or(|build_id| task.build_id() == build_id)
    }
}

/// Zero-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRequest {
    page: u32,
    size: u32,
}

impl PageRequest {
    /// Page size used when none is requested.
    pub const DEFAULT_SIZE: u32 = 20;
    /// Largest page size served.
    pub const MAX_SIZE: u32 = 100;

    /// Creates a page request, clamping `size` to `1..=MAX_SIZE`.
    #[must_use]
    pub fn new(page: u32, size: u32) -> Self {
        Self {
            page,
            size: size.clamp(1, Self::MAX_SIZE),
        }
    }

    /// Returns the zero-based page index.
    #[must_use]
    pub const fn page(self) -> u32 {
        self.page
    }

    /// Returns the page size.
    #[must_use]
    pub const fn size(self) -> u32 {
        self.size
    }

    /// Returns the number of rows to skip.
    #[must_use]
    pub const fn offset(self) -> u64 {
        (self.page as u64).saturating_mul(self.size as u64)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(0, Self::DEFAULT_SIZE)
    }
}

/// One page of results plus the total row count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    /// Rows on this page.
    pub items: Vec<T>,
    /// Requested page index.
    pub page: u32,
    /// Requested page size.
    pub size: u32,
    /// Rows across all pages.
    pub total: u64,
}

/// Number of rows in one status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCount<S> {
    /// The status counted.
    pub status: S,
    /// Rows in that status.
    pub count: u64,
}

/// Count of tasks in one (type, status) cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskTypeStatusCount {
    /// Pipeline stage.
    pub task_type: TaskType,
    /// Task status.
    pub status: TaskStatus,
    /// Tasks in the cell.
    pub count: u64,
}

/// Average time from creation to completion for one task type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionStat {
    /// Pipeline stage.
    pub task_type: TaskType,
    /// Completed tasks measured.
    pub completed: u64,
    /// Mean seconds between creation and completion.
    pub average_seconds: f64,
}

/// Aggregate queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    /// Counts per (type, status).
    pub counts: Vec<TaskTypeStatusCount>,
    /// Average completion duration per type.
    pub completion: Vec<CompletionStat>,
}

/// Connection pool health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreHealth {
    /// Open connections.
    pub connections: u32,
    /// Idle connections.
    pub idle_connections: u32,
    /// Configured pool ceiling.
    pub max_size: u32,
    /// Whether a connection could be checked out.
    pub reachable: bool,
}

/// Errors returned by task store implementations.
#[derive(Debug, Clone, Error)]
pub enum TaskStoreError {
    /// A build with the same job and build number already exists.
    #[error("duplicate build {job}#{build_number}")]
    DuplicateBuild {
        /// CI job name.
        job: JobName,
        /// CI build number.
        build_number: BuildNumber,
    },

    /// A task with the same identifier already exists.
    #[error("duplicate task identifier: {0}")]
    DuplicateTask(TaskId),

    /// The owning build does not exist.
    #[error("build not found: {0}")]
    BuildNotFound(BuildId),

    /// The task state machine rejected a mutation.
    #[error(transparent)]
    InvalidTransition(#[from] QueueDomainError),

    /// Persistence-layer failure.
    #[error("persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl TaskStoreError {
    /// Wraps a persistence error.
    pub fn persistence(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Persistence(Arc::new(err))
    }
}

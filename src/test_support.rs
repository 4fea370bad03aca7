//! Shared fixtures for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use mockable::Clock;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::queue::{
    adapters::memory::InMemoryTaskStore,
    domain::{
        Build, BuildId, BuildStatus, BuildSubmission, Task, TaskId, TaskMutation, TaskStatus,
        TaskType,
    },
    ports::{
        BuildUpdate, Page, PageRequest, QueueStats, StatusCount, StoreHealth, TaskQuery,
        TaskStore, TaskStoreError, TaskStoreResult, TaskTransition, TransitionCommit,
    },
    services::{
        ClassifiedError, FailureClass, RetryHandler, RetryPolicy, SubmittedBuild,
        TaskQueueService,
    },
};

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        let offset = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        *now += offset;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(
            Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
        )
    }
}

impl Clock for ManualClock {
    fn local(&self) -> DateTime<Local> {
        self.utc().with_timezone(&Local)
    }

    fn utc(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handler-style failure with a chosen class.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TestFailure {
    pub class: FailureClass,
    pub message: String,
}

impl TestFailure {
    pub fn new(class: FailureClass, message: &str) -> Self {
        Self {
            class,
            message: message.to_owned(),
        }
    }
}

impl ClassifiedError for TestFailure {
    fn failure_class(&self) -> FailureClass {
        self.class
    }
}

pub struct Harness<S: TaskStore = InMemoryTaskStore> {
    pub store: Arc<S>,
    pub clock: Arc<ManualClock>,
    pub queue: TaskQueueService<S, ManualClock>,
    pub retry: RetryHandler<S, ManualClock>,
}

impl Harness {
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::with_store(Arc::new(InMemoryTaskStore::new()), policy)
    }
}

impl<S: TaskStore> Harness<S> {
    pub fn with_store(store: Arc<S>, policy: RetryPolicy) -> Self {
        let clock = Arc::new(ManualClock::default());
        let queue = TaskQueueService::new(Arc::clone(&store), Arc::clone(&clock));
        let retry = RetryHandler::new(queue.clone(), policy);
        Self {
            store,
            clock,
            queue,
            retry,
        }
    }

    pub async fn submit(&self, build_number: u64) -> eyre::Result<SubmittedBuild> {
        Ok(self
            .queue
            .submit_build(BuildSubmission::new("acme-app", build_number), TaskType::PLAN)
            .await?)
    }
}

/// Policy that makes requeued tasks claimable immediately.
pub fn immediate_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        jitter: None,
    }
}

/// In-memory store whose multi-write commits fail while armed, as a
/// dropped database connection would.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemoryTaskStore,
    failing: AtomicBool,
}

impl FaultyStore {
    pub fn arm(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn insert_build(&self, build: &Build, first_task: &Task) -> TaskStoreResult<()> {
        self.inner.insert_build(build, first_task).await
    }

    async fn insert_task(&self, task: &Task) -> TaskStoreResult<()> {
        self.inner.insert_task(task).await
    }

    async fn claim_next(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        self.inner.claim_next(task_type, now).await
    }

    async fn update_task(
        &self,
        id: TaskId,
        mutation: &TaskMutation,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        self.inner.update_task(id, mutation, now).await
    }

    async fn commit_transition(
        &self,
        id: TaskId,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<TransitionCommit>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TaskStoreError::persistence(io::Error::other("connection reset")));
        }
        self.inner.commit_transition(id, transition, now).await
    }

    async fn update_build_status(
        &self,
        id: BuildId,
        status: BuildStatus,
        only_from: &[BuildStatus],
        now: DateTime<Utc>,
    ) -> TaskStoreResult<BuildUpdate> {
        self.inner.update_build_status(id, status, only_from, now).await
    }

    async fn find_task(&self, id: TaskId) -> TaskStoreResult<Option<Task>> {
        self.inner.find_task(id).await
    }

    async fn find_build(&self, id: BuildId) -> TaskStoreResult<Option<Build>> {
        self.inner.find_build(id).await
    }

    async fn list_tasks(
        &self,
        query: &TaskQuery,
        page: PageRequest,
    ) -> TaskStoreResult<Page<Task>> {
        self.inner.list_tasks(query, page).await
    }

    async fn list_builds(&self, page: PageRequest) -> TaskStoreResult<Page<Build>> {
        self.inner.list_builds(page).await
    }

    async fn tasks_for_build(&self, build_id: BuildId) -> TaskStoreResult<Vec<Task>> {
        self.inner.tasks_for_build(build_id).await
    }

    async fn task_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<TaskStatus>>> {
        self.inner.task_status_counts().await
    }

    async fn build_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<BuildStatus>>> {
        self.inner.build_status_counts().await
    }

    async fn queue_stats(&self) -> TaskStoreResult<QueueStats> {
        self.inner.queue_stats().await
    }

    async fn find_stale_in_progress(&self, cutoff: DateTime<Utc>) -> TaskStoreResult<Vec<Task>> {
        self.inner.find_stale_in_progress(cutoff).await
    }

    async fn health(&self) -> TaskStoreResult<StoreHealth> {
        self.inner.health().await
    }
}

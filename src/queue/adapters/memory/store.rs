//! In-memory task store for tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::queue::{
    domain::{
        Build, BuildId, BuildNumber, BuildStatus, JobName, Task, TaskId, TaskMutation, TaskStatus,
        TaskType,
    },
    ports::{
        BuildChange, BuildUpdate, CompletionStat, Page, PageRequest, QueueStats, StatusCount,
        StoreHealth, TaskQuery, TaskStore, TaskStoreError, TaskStoreResult, TaskTransition,
        TaskTypeStatusCount, TransitionCommit,
    },
};

/// Thread-safe in-memory task store.
///
/// Every operation runs under one lock, so claims are trivially exclusive.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<RwLock<InMemoryQueueState>>,
}

#[derive(Debug, Default)]
struct InMemoryQueueState {
    builds: HashMap<BuildId, Build>,
    build_keys: HashMap<(JobName, BuildNumber), BuildId>,
    tasks: HashMap<TaskId, Task>,
}

impl InMemoryTaskStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> TaskStoreResult<RwLockReadGuard<'_, InMemoryQueueState>> {
        self.state
            .read()
            .map_err(|err| TaskStoreError::persistence(std::io::Error::other(err.to_string())))
    }

    fn write(&self) -> TaskStoreResult<RwLockWriteGuard<'_, InMemoryQueueState>> {
        self.state
            .write()
            .map_err(|err| TaskStoreError::persistence(std::io::Error::other(err.to_string())))
    }
}

impl InMemoryQueueState {
    fn check_insertable(&self, task: &Task) -> TaskStoreResult<()> {
        if !self.builds.contains_key(&task.build_id()) {
            return Err(TaskStoreError::BuildNotFound(task.build_id()));
        }
        if self.tasks.contains_key(&task.id()) {
            return Err(TaskStoreError::DuplicateTask(task.id()));
        }
        Ok(())
    }

    fn insert_task(&mut self, task: &Task) -> TaskStoreResult<()> {
        self.check_insertable(task)?;
        self.tasks.insert(task.id(), task.clone());
        Ok(())
    }

    /// Computes a build change without writing it.
    fn staged_build_update(
        &self,
        id: BuildId,
        change: &BuildChange,
        now: DateTime<Utc>,
    ) -> BuildUpdate {
        let Some(current) = self.builds.get(&id) else {
            return BuildUpdate::Missing;
        };
        let mut build = current.clone();
        if build.transition_to(change.status, &change.only_from, now).is_err() {
            return BuildUpdate::Unchanged(current.clone());
        }
        BuildUpdate::Updated(build)
    }

    fn tasks_oldest_first(&self, query: &TaskQuery) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self
            .tasks
            .values()
            .filter(|task| query.matches(task))
            .collect();
        tasks.sort_by_key(|task| (task.created_at(), task.id()));
        tasks
    }
}

fn paginate<T: Clone>(rows: &[&T], page: PageRequest) -> Page<T> {
    let skip = usize::try_from(page.offset()).unwrap_or(usize::MAX);
    let take = usize::try_from(page.size()).unwrap_or(usize::MAX);
    Page {
        items: rows
            .iter()
            .skip(skip)
            .take(take)
            .map(|row| (*row).clone())
            .collect(),
        page: page.page(),
        size: page.size(),
        total: u64::try_from(rows.len()).unwrap_or(u64::MAX),
    }
}

fn count_by<S, I>(statuses: I, all: &[S]) -> Vec<StatusCount<S>>
where
    S: Copy + PartialEq,
    I: Iterator<Item = S> + Clone,
{
    all.iter()
        .map(|status| StatusCount {
            status: *status,
            count: u64::try_from(statuses.clone().filter(|seen| seen == status).count())
                .unwrap_or(u64::MAX),
        })
        .filter(|entry| entry.count > 0)
        .collect()
}

fn completion_stats(tasks: &HashMap<TaskId, Task>) -> Vec<CompletionStat> {
    let mut totals: BTreeMap<TaskType, (u64, u64)> = BTreeMap::new();
    for task in tasks.values() {
        if task.status() != TaskStatus::Completed {
            continue;
        }
        let elapsed = task
            .updated_at()
            .signed_duration_since(task.created_at())
            .num_milliseconds();
        let millis = u64::try_from(elapsed).unwrap_or(0);
        let entry = totals.entry(task.task_type().clone()).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(1);
        entry.1 = entry.1.saturating_add(millis);
    }

    totals
        .into_iter()
        .map(|(task_type, (completed, total_millis))| CompletionStat {
            task_type,
            completed,
            average_seconds: Duration::from_millis(
                total_millis.checked_div(completed).unwrap_or(0),
            )
            .as_secs_f64(),
        })
        .collect()
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_build(&self, build: &Build, first_task: &Task) -> TaskStoreResult<()> {
        let mut state = self.write()?;
        let key = (build.job().clone(), build.build_number());
        if state.build_keys.contains_key(&key) || state.builds.contains_key(&build.id()) {
            return Err(TaskStoreError::DuplicateBuild {
                job: build.job().clone(),
                build_number: build.build_number(),
            });
        }
        if state.tasks.contains_key(&first_task.id()) {
            return Err(TaskStoreError::DuplicateTask(first_task.id()));
        }
        if first_task.build_id() != build.id() {
            return Err(TaskStoreError::BuildNotFound(first_task.build_id()));
        }

        state.build_keys.insert(key, build.id());
        state.builds.insert(build.id(), build.clone());
        state.tasks.insert(first_task.id(), first_task.clone());
        Ok(())
    }

    async fn insert_task(&self, task: &Task) -> TaskStoreResult<()> {
        self.write()?.insert_task(task)
    }

    async fn claim_next(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        let mut state = self.write()?;
        let candidate = state
            .tasks
            .values()
            .filter(|task| task.task_type() == task_type && task.is_claimable_at(now))
            .min_by_key(|task| (task.created_at(), task.id()))
            .map(Task::id);

        let Some(task_id) = candidate else {
            return Ok(None);
        };
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return Ok(None);
        };
        task.claim(now)?;
        Ok(Some(task.clone()))
    }

    async fn update_task(
        &self,
        id: TaskId,
        mutation: &TaskMutation,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        let mut state = self.write()?;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(None);
        };
        task.apply(mutation, now)?;
        Ok(Some(task.clone()))
    }

    async fn commit_transition(
        &self,
        id: TaskId,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<TransitionCommit>> {
        let mut state = self.write()?;
        let Some(current) = state.tasks.get(&id) else {
            return Ok(None);
        };

        let mut task = current.clone();
        task.apply(transition.mutation(), now)?;
        if let Some(next) = transition.enqueue() {
            state.check_insertable(next)?;
        }
        let build = transition
            .build_change()
            .map(|change| state.staged_build_update(task.build_id(), change, now));

        state.tasks.insert(id, task.clone());
        if let Some(next) = transition.enqueue() {
            state.tasks.insert(next.id(), next.clone());
        }
        if let Some(BuildUpdate::Updated(updated)) = &build {
            state.builds.insert(updated.id(), updated.clone());
        }
        Ok(Some(TransitionCommit {
            task,
            enqueued: transition.enqueue().cloned(),
            build,
        }))
    }

    async fn update_build_status(
        &self,
        id: BuildId,
        status: BuildStatus,
        only_from: &[BuildStatus],
        now: DateTime<Utc>,
    ) -> TaskStoreResult<BuildUpdate> {
        let mut state = self.write()?;
        let Some(build) = state.builds.get_mut(&id) else {
            return Ok(BuildUpdate::Missing);
        };
        if build.transition_to(status, only_from, now).is_err() {
            return Ok(BuildUpdate::Unchanged(build.clone()));
        }
        Ok(BuildUpdate::Updated(build.clone()))
    }

    async fn find_task(&self, id: TaskId) -> TaskStoreResult<Option<Task>> {
        Ok(self.read()?.tasks.get(&id).cloned())
    }

    async fn find_build(&self, id: BuildId) -> TaskStoreResult<Option<Build>> {
        Ok(self.read()?.builds.get(&id).cloned())
    }

    async fn list_tasks(
        &self,
        query: &TaskQuery,
        page: PageRequest,
    ) -> TaskStoreResult<Page<Task>> {
        let state = self.read()?;
        let rows = state.tasks_oldest_first(query);
        Ok(paginate(&rows, page))
    }

    async fn list_builds(&self, page: PageRequest) -> TaskStoreResult<Page<Build>> {
        let state = self.read()?;
        let mut rows: Vec<&Build> = state.builds.values().collect();
        rows.sort_by_key(|build| (std::cmp::Reverse(build.created_at()), build.id()));
        Ok(paginate(&rows, page))
    }

    async fn tasks_for_build(&self, build_id: BuildId) -> TaskStoreResult<Vec<Task>> {
        let state = self.read()?;
        let query = TaskQuery {
            status: None,
            build_id: Some(build_id),
        };
        Ok(state
            .tasks_oldest_first(&query)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn task_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<TaskStatus>>> {
        let state = self.read()?;
        Ok(count_by(
            state.tasks.values().map(Task::status),
            &TaskStatus::ALL,
        ))
    }

    async fn build_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<BuildStatus>>> {
        let state = self.read()?;
        Ok(count_by(
            state.builds.values().map(Build::status),
            &BuildStatus::ALL,
        ))
    }

    async fn queue_stats(&self) -> TaskStoreResult<QueueStats> {
        let state = self.read()?;
        let mut cells: BTreeMap<(TaskType, &'static str), (TaskStatus, u64)> = BTreeMap::new();
        for task in state.tasks.values() {
            let entry = cells
                .entry((task.task_type().clone(), task.status().as_str()))
                .or_insert((task.status(), 0));
            entry.1 = entry.1.saturating_add(1);
        }

        Ok(QueueStats {
            counts: cells
                .into_iter()
                .map(|((task_type, _), (status, count))| TaskTypeStatusCount {
                    task_type,
                    status,
                    count,
                })
                .collect(),
            completion: completion_stats(&state.tasks),
        })
    }

    async fn find_stale_in_progress(&self, cutoff: DateTime<Utc>) -> TaskStoreResult<Vec<Task>> {
        let state = self.read()?;
        let query = TaskQuery {
            status: Some(TaskStatus::InProgress),
            build_id: None,
        };
        Ok(state
            .tasks_oldest_first(&query)
            .into_iter()
            .filter(|task| task.updated_at() < cutoff)
            .cloned()
            .collect())
    }

    async fn health(&self) -> TaskStoreResult<StoreHealth> {
        let reachable = self.read().is_ok();
        Ok(StoreHealth {
            connections: 1,
            idle_connections: 1,
            max_size: 1,
            reachable,
        })
    }
}

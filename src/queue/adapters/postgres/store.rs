//! `PostgreSQL` task store with `FOR UPDATE SKIP LOCKED` claims.

use super::{
    models::{
        BuildRow, CompletionRow, NewBuildRow, NewTaskRow, StatusCountRow, TaskChangeset, TaskRow,
        TypeStatusCountRow,
    },
    schema::{builds, tasks},
};
use crate::queue::{
    domain::{
        Build, BuildId, BuildNumber, BuildStatus, JobName, Payload, PersistedBuildData,
        PersistedTaskData, Task, TaskId, TaskMutation, TaskStatus, TaskType,
    },
    ports::{
        BuildChange, BuildUpdate, CompletionStat, Page, PageRequest, QueueStats, StatusCount,
        StoreHealth, TaskQuery, TaskStore, TaskStoreError, TaskStoreResult, TaskTransition,
        TaskTypeStatusCount, TransitionCommit,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::{Pg, PgConnection};
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorInformation, DatabaseErrorKind, Error as DieselError};

/// `PostgreSQL` connection pool type used by the queue adapter.
pub type TaskPgPool = Pool<ConnectionManager<PgConnection>>;

const BUILD_UNIQUE_CONSTRAINT: &str = "builds_job_build_number_key";

/// One statement: lock the oldest eligible row, skipping rows other workers
/// hold, and move it to `IN_PROGRESS`.
const CLAIM_NEXT_SQL: &str = concat!(
    "WITH candidate AS (",
    "SELECT id FROM tasks ",
    "WHERE type = $1 ",
    "AND (status = 'PENDING' OR (status = 'RETRY' ",
    "AND (available_at IS NULL OR available_at <= $2))) ",
    "AND attempt < max_attempts ",
    "ORDER BY created_at ASC, id ASC ",
    "LIMIT 1 ",
    "FOR UPDATE SKIP LOCKED) ",
    "UPDATE tasks SET status = 'IN_PROGRESS', attempt = tasks.attempt + 1, ",
    "available_at = NULL, updated_at = $2 ",
    "FROM candidate WHERE tasks.id = candidate.id ",
    "RETURNING tasks.id, tasks.build_id, tasks.type AS task_type, tasks.status, tasks.attempt, ",
    "tasks.max_attempts, tasks.payload, tasks.error_message, tasks.available_at, ",
    "tasks.created_at, tasks.updated_at",
);

const TASK_STATUS_COUNTS_SQL: &str =
    "SELECT status, COUNT(*) AS count FROM tasks GROUP BY status ORDER BY status";

const BUILD_STATUS_COUNTS_SQL: &str =
    "SELECT status, COUNT(*) AS count FROM builds GROUP BY status ORDER BY status";

const TYPE_STATUS_COUNTS_SQL: &str = concat!(
    "SELECT type AS task_type, status, COUNT(*) AS count FROM tasks ",
    "GROUP BY type, status ORDER BY type, status",
);

const COMPLETION_SQL: &str = concat!(
    "SELECT type AS task_type, COUNT(*) AS completed, ",
    "AVG(EXTRACT(EPOCH FROM (updated_at - created_at)))::DOUBLE PRECISION AS average_seconds ",
    "FROM tasks WHERE status = 'COMPLETED' GROUP BY type ORDER BY type",
);

/// `PostgreSQL`-backed task store.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: TaskPgPool,
}

impl PostgresTaskStore {
    /// Creates a new store from a `PostgreSQL` connection pool.
    #[must_use]
    pub const fn new(pool: TaskPgPool) -> Self {
        Self { pool }
    }

    async fn run_blocking<F, T>(&self, f: F) -> TaskStoreResult<T>
    where
        F: FnOnce(&mut PgConnection) -> TaskStoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut connection = pool.get().map_err(TaskStoreError::persistence)?;
            f(&mut connection)
        })
        .await
        .map_err(TaskStoreError::persistence)?
    }
}

impl From<DieselError> for TaskStoreError {
    fn from(err: DieselError) -> Self {
        Self::persistence(err)
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert_build(&self, build: &Build, first_task: &Task) -> TaskStoreResult<()> {
        let job = build.job().clone();
        let build_number = build.build_number();
        let task_id = first_task.id();
        let build_row = to_new_build_row(build)?;
        let task_row = to_new_task_row(first_task)?;

        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                diesel::insert_into(builds::table)
                    .values(&build_row)
                    .execute(tx)
                    .map_err(|err| match err {
                        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                            TaskStoreError::DuplicateBuild {
                                job: job.clone(),
                                build_number,
                            }
                        }
                        _ => TaskStoreError::persistence(err),
                    })?;
                diesel::insert_into(tasks::table)
                    .values(&task_row)
                    .execute(tx)
                    .map_err(|err| map_task_insert_error(err, task_id))?;
                Ok(())
            })
        })
        .await
    }

    async fn insert_task(&self, task: &Task) -> TaskStoreResult<()> {
        let task_id = task.id();
        let build_id = task.build_id();
        let row = to_new_task_row(task)?;
        self.run_blocking(move |connection| insert_task_row(connection, &row, task_id, build_id))
            .await
    }

    async fn claim_next(
        &self,
        task_type: &TaskType,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        let task_type_value = task_type.as_str().to_owned();
        self.run_blocking(move |connection| {
            let row = diesel::sql_query(CLAIM_NEXT_SQL)
                .bind::<diesel::sql_types::Varchar, _>(task_type_value)
                .bind::<diesel::sql_types::Timestamptz, _>(now)
                .get_result::<TaskRow>(connection)
                .optional()?;
            row.map(row_to_task).transpose()
        })
        .await
    }

    async fn update_task(
        &self,
        id: TaskId,
        mutation: &TaskMutation,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<Task>> {
        let change = mutation.clone();
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                apply_task_mutation(tx, id, &change, now)
            })
        })
        .await
    }

    async fn commit_transition(
        &self,
        id: TaskId,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> TaskStoreResult<Option<TransitionCommit>> {
        let change = transition.clone();
        let follow_up = transition
            .enqueue()
            .map(|task| to_new_task_row(task).map(|row| (row, task.id(), task.build_id())))
            .transpose()?;

        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                let Some(task) = apply_task_mutation(tx, id, change.mutation(), now)? else {
                    return Ok(None);
                };
                let build = change
                    .build_change()
                    .map(|build_change| {
                        apply_build_change(tx, task.build_id(), build_change, now)
                    })
                    .transpose()?;
                if let Some((row, task_id, build_id)) = &follow_up {
                    insert_task_row(tx, row, *task_id, *build_id)?;
                }
                Ok(Some(TransitionCommit {
                    task,
                    enqueued: change.enqueue().cloned(),
                    build,
                }))
            })
        })
        .await
    }

    async fn update_build_status(
        &self,
        id: BuildId,
        status: BuildStatus,
        only_from: &[BuildStatus],
        now: DateTime<Utc>,
    ) -> TaskStoreResult<BuildUpdate> {
        let change = BuildChange {
            status,
            only_from: only_from.to_vec(),
        };
        self.run_blocking(move |connection| {
            connection.transaction::<_, TaskStoreError, _>(|tx| {
                apply_build_change(tx, id, &change, now)
            })
        })
        .await
    }

    async fn find_task(&self, id: TaskId) -> TaskStoreResult<Option<Task>> {
        self.run_blocking(move |connection| {
            let row = tasks::table
                .filter(tasks::id.eq(id.into_inner()))
                .select(TaskRow::as_select())
                .first::<TaskRow>(connection)
                .optional()?;
            row.map(row_to_task).transpose()
        })
        .await
    }

    async fn find_build(&self, id: BuildId) -> TaskStoreResult<Option<Build>> {
        self.run_blocking(move |connection| {
            let row = builds::table
                .filter(builds::id.eq(id.into_inner()))
                .select(BuildRow::as_select())
                .first::<BuildRow>(connection)
                .optional()?;
            row.map(row_to_build).transpose()
        })
        .await
    }

    async fn list_tasks(
        &self,
        query: &TaskQuery,
        page: PageRequest,
    ) -> TaskStoreResult<Page<Task>> {
        let filter = query.clone();
        self.run_blocking(move |connection| {
            let total = filtered_tasks(&filter)
                .count()
                .get_result::<i64>(connection)?;
            let rows = filtered_tasks(&filter)
                .order((tasks::created_at.asc(), tasks::id.asc()))
                .limit(i64::from(page.size()))
                .offset(to_i64(page.offset())?)
                .select(TaskRow::as_select())
                .load::<TaskRow>(connection)?;
            let items = rows
                .into_iter()
                .map(row_to_task)
                .collect::<TaskStoreResult<Vec<_>>>()?;
            Ok(Page {
                items,
                page: page.page(),
                size: page.size(),
                total: to_u64(total)?,
            })
        })
        .await
    }

    async fn list_builds(&self, page: PageRequest) -> TaskStoreResult<Page<Build>> {
        self.run_blocking(move |connection| {
            let total = builds::table.count().get_result::<i64>(connection)?;
            let rows = builds::table
                .order((builds::created_at.desc(), builds::id.asc()))
                .limit(i64::from(page.size()))
                .offset(to_i64(page.offset())?)
                .select(BuildRow::as_select())
                .load::<BuildRow>(connection)?;
            let items = rows
                .into_iter()
                .map(row_to_build)
                .collect::<TaskStoreResult<Vec<_>>>()?;
            Ok(Page {
                items,
                page: page.page(),
                size: page.size(),
                total: to_u64(total)?,
            })
        })
        .await
    }

    async fn tasks_for_build(&self, build_id: BuildId) -> TaskStoreResult<Vec<Task>> {
        self.run_blocking(move |connection| {
            tasks::table
                .filter(tasks::build_id.eq(build_id.into_inner()))
                .order((tasks::created_at.asc(), tasks::id.asc()))
                .select(TaskRow::as_select())
                .load::<TaskRow>(connection)?
                .into_iter()
                .map(row_to_task)
                .collect()
        })
        .await
    }

    async fn task_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<TaskStatus>>> {
        self.run_blocking(|connection| {
            diesel::sql_query(TASK_STATUS_COUNTS_SQL)
                .load::<StatusCountRow>(connection)?
                .into_iter()
                .map(|row| {
                    Ok(StatusCount {
                        status: TaskStatus::try_from(row.status.as_str())
                            .map_err(TaskStoreError::persistence)?,
                        count: to_u64(row.count)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn build_status_counts(&self) -> TaskStoreResult<Vec<StatusCount<BuildStatus>>> {
        self.run_blocking(|connection| {
            diesel::sql_query(BUILD_STATUS_COUNTS_SQL)
                .load::<StatusCountRow>(connection)?
                .into_iter()
                .map(|row| {
                    Ok(StatusCount {
                        status: BuildStatus::try_from(row.status.as_str())
                            .map_err(TaskStoreError::persistence)?,
                        count: to_u64(row.count)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn queue_stats(&self) -> TaskStoreResult<QueueStats> {
        self.run_blocking(|connection| {
            let counts = diesel::sql_query(TYPE_STATUS_COUNTS_SQL)
                .load::<TypeStatusCountRow>(connection)?
                .into_iter()
                .map(|row| {
                    Ok(TaskTypeStatusCount {
                        task_type: TaskType::new(&row.task_type)
                            .map_err(TaskStoreError::persistence)?,
                        status: TaskStatus::try_from(row.status.as_str())
                            .map_err(TaskStoreError::persistence)?,
                        count: to_u64(row.count)?,
                    })
                })
                .collect::<TaskStoreResult<Vec<_>>>()?;
            let completion = diesel::sql_query(COMPLETION_SQL)
                .load::<CompletionRow>(connection)?
                .into_iter()
                .map(|row| {
                    Ok(CompletionStat {
                        task_type: TaskType::new(&row.task_type)
                            .map_err(TaskStoreError::persistence)?,
                        completed: to_u64(row.completed)?,
                        average_seconds: row.average_seconds,
                    })
                })
                .collect::<TaskStoreResult<Vec<_>>>()?;
            Ok(QueueStats { counts, completion })
        })
        .await
    }

    async fn find_stale_in_progress(&self, cutoff: DateTime<Utc>) -> TaskStoreResult<Vec<Task>> {
        self.run_blocking(move |connection| {
            tasks::table
                .filter(tasks::status.eq(TaskStatus::InProgress.as_str()))
                .filter(tasks::updated_at.lt(cutoff))
                .order((tasks::updated_at.asc(), tasks::id.asc()))
                .select(TaskRow::as_select())
                .load::<TaskRow>(connection)?
                .into_iter()
                .map(row_to_task)
                .collect()
        })
        .await
    }

    async fn health(&self) -> TaskStoreResult<StoreHealth> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let reachable = pool.get().is_ok_and(|mut connection| {
                diesel::sql_query("SELECT 1")
                    .execute(&mut *connection)
                    .is_ok()
            });
            let state = pool.state();
            StoreHealth {
                connections: state.connections,
                idle_connections: state.idle_connections,
                max_size: pool.max_size(),
                reachable,
            }
        })
        .await
        .map_err(TaskStoreError::persistence)
    }
}

fn insert_task_row(
    connection: &mut PgConnection,
    row: &NewTaskRow,
    task_id: TaskId,
    build_id: BuildId,
) -> TaskStoreResult<()> {
    diesel::insert_into(tasks::table)
        .values(row)
        .execute(connection)
        .map_err(|err| match err {
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                TaskStoreError::BuildNotFound(build_id)
            }
            _ => map_task_insert_error(err, task_id),
        })?;
    Ok(())
}

/// Locks the task row, applies `mutation`, and writes it back. Must run
/// inside a transaction.
fn apply_task_mutation(
    tx: &mut PgConnection,
    id: TaskId,
    mutation: &TaskMutation,
    now: DateTime<Utc>,
) -> TaskStoreResult<Option<Task>> {
    let row = tasks::table
        .filter(tasks::id.eq(id.into_inner()))
        .select(TaskRow::as_select())
        .for_update()
        .first::<TaskRow>(tx)
        .optional()?;
    let Some(current) = row else {
        return Ok(None);
    };

    let mut task = row_to_task(current)?;
    task.apply(mutation, now)?;
    diesel::update(tasks::table.filter(tasks::id.eq(id.into_inner())))
        .set(&to_changeset(&task)?)
        .execute(tx)?;
    Ok(Some(task))
}

/// Locks the build row and applies `change` when eligible. Must run inside
/// a transaction.
fn apply_build_change(
    tx: &mut PgConnection,
    id: BuildId,
    change: &BuildChange,
    now: DateTime<Utc>,
) -> TaskStoreResult<BuildUpdate> {
    let row = builds::table
        .filter(builds::id.eq(id.into_inner()))
        .select(BuildRow::as_select())
        .for_update()
        .first::<BuildRow>(tx)
        .optional()?;
    let Some(current) = row else {
        return Ok(BuildUpdate::Missing);
    };

    let mut build = row_to_build(current)?;
    if build
        .transition_to(change.status, &change.only_from, now)
        .is_err()
    {
        return Ok(BuildUpdate::Unchanged(build));
    }
    diesel::update(builds::table.filter(builds::id.eq(id.into_inner())))
        .set((
            builds::status.eq(build.status().as_str()),
            builds::updated_at.eq(build.updated_at()),
        ))
        .execute(tx)?;
    Ok(BuildUpdate::Updated(build))
}

fn filtered_tasks(query: &TaskQuery) -> tasks::BoxedQuery<'static, Pg> {
    let mut statement = tasks::table.into_boxed();
    if let Some(status) = query.status {
        statement = statement.filter(tasks::status.eq(status.as_str()));
    }
    if let Some(build_id) = query.build_id {
        statement = statement.filter(tasks::build_id.eq(build_id.into_inner()));
    }
    statement
}

fn map_task_insert_error(err: DieselError, task_id: TaskId) -> TaskStoreError {
    match err {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, ref info)
            if !is_build_unique_violation(info.as_ref()) =>
        {
            TaskStoreError::DuplicateTask(task_id)
        }
        _ => TaskStoreError::persistence(err),
    }
}

fn is_build_unique_violation(info: &dyn DatabaseErrorInformation) -> bool {
    info.constraint_name()
        .is_some_and(|name| name == BUILD_UNIQUE_CONSTRAINT)
}

fn to_i64(value: u64) -> TaskStoreResult<i64> {
    i64::try_from(value).map_err(TaskStoreError::persistence)
}

fn to_u64(value: i64) -> TaskStoreResult<u64> {
    u64::try_from(value).map_err(TaskStoreError::persistence)
}

fn to_i32(value: u32) -> TaskStoreResult<i32> {
    i32::try_from(value).map_err(TaskStoreError::persistence)
}

fn to_u32(value: i32) -> TaskStoreResult<u32> {
    u32::try_from(value).map_err(TaskStoreError::persistence)
}

fn to_new_build_row(build: &Build) -> TaskStoreResult<NewBuildRow> {
    Ok(NewBuildRow {
        id: build.id().into_inner(),
        job: build.job().as_str().to_owned(),
        build_number: to_i64(build.build_number().value())?,
        branch: build.branch().map(str::to_owned),
        repo_url: build.repo_url().map(str::to_owned),
        commit_sha: build.commit_sha().map(str::to_owned),
        status: build.status().as_str().to_owned(),
        payload: build.payload().to_value(),
        created_at: build.created_at(),
        updated_at: build.updated_at(),
    })
}

fn to_new_task_row(task: &Task) -> TaskStoreResult<NewTaskRow> {
    Ok(NewTaskRow {
        id: task.id().into_inner(),
        build_id: task.build_id().into_inner(),
        task_type: task.task_type().as_str().to_owned(),
        status: task.status().as_str().to_owned(),
        attempt: to_i32(task.attempt())?,
        max_attempts: to_i32(task.max_attempts())?,
        payload: task.payload().to_value(),
        error_message: task.error_message().map(str::to_owned),
        available_at: task.available_at(),
        created_at: task.created_at(),
        updated_at: task.updated_at(),
    })
}

fn to_changeset(task: &Task) -> TaskStoreResult<TaskChangeset> {
    Ok(TaskChangeset {
        status: task.status().as_str().to_owned(),
        attempt: to_i32(task.attempt())?,
        error_message: task.error_message().map(str::to_owned),
        available_at: task.available_at(),
        updated_at: task.updated_at(),
    })
}

fn row_to_build(row: BuildRow) -> TaskStoreResult<Build> {
    let BuildRow {
        id,
        job,
        build_number,
        branch,
        repo_url,
        commit_sha,
        status: persisted_status,
        payload,
        created_at,
        updated_at,
    } = row;

    let number = u64::try_from(build_number).map_err(TaskStoreError::persistence)?;
    let data = PersistedBuildData {
        id: BuildId::from_uuid(id),
        job: JobName::new(job).map_err(TaskStoreError::persistence)?,
        build_number: BuildNumber::new(number).map_err(TaskStoreError::persistence)?,
        branch,
        repo_url,
        commit_sha,
        status: BuildStatus::try_from(persisted_status.as_str())
            .map_err(TaskStoreError::persistence)?,
        payload: Payload::from_value(payload),
        created_at,
        updated_at,
    };
    Ok(Build::from_persisted(data))
}

fn row_to_task(row: TaskRow) -> TaskStoreResult<Task> {
    let TaskRow {
        id,
        build_id,
        task_type,
        status: persisted_status,
        attempt,
        max_attempts,
        payload,
        error_message,
        available_at,
        created_at,
        updated_at,
    } = row;

    let data = PersistedTaskData {
        id: TaskId::from_uuid(id),
        build_id: BuildId::from_uuid(build_id),
        task_type: TaskType::new(&task_type).map_err(TaskStoreError::persistence)?,
        status: TaskStatus::try_from(persisted_status.as_str())
            .map_err(TaskStoreError::persistence)?,
        attempt: to_u32(attempt)?,
        max_attempts: to_u32(max_attempts)?,
        payload: Payload::from_value(payload),
        error_message,
        available_at,
        created_at,
        updated_at,
    };
    Ok(Task::from_persisted(data))
}

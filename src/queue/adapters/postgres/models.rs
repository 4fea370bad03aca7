//! Diesel row models for build and task persistence.

use super::schema::{builds, tasks};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;

/// Query result row for build records.
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = builds)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct BuildRow {
    /// Internal build identifier.
    pub id: uuid::Uuid,
    /// CI job name.
    pub job: String,
    /// CI build number.
    pub build_number: i64,
    /// Branch name.
    pub branch: Option<String>,
    /// Repository URL.
    pub repo_url: Option<String>,
    /// Failing commit SHA.
    pub commit_sha: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Failure report payload.
    pub payload: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Insert model for build records.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = builds)]
pub struct NewBuildRow {
    /// Internal build identifier.
    pub id: uuid::Uuid,
    /// CI job name.
    pub job: String,
    /// CI build number.
    pub build_number: i64,
    /// Branch name.
    pub branch: Option<String>,
    /// Repository URL.
    pub repo_url: Option<String>,
    /// Failing commit SHA.
    pub commit_sha: Option<String>,
    /// Lifecycle status.
    pub status: String,
    /// Failure report payload.
    pub payload: Value,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Query result row for task records.
///
/// Raw SQL must alias the `type` column as `task_type`.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = tasks)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TaskRow {
    /// Internal task identifier.
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    pub id: uuid::Uuid,
    /// Owning build.
    #[diesel(sql_type = diesel::sql_types::Uuid)]
    pub build_id: uuid::Uuid,
    /// Pipeline stage tag.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub task_type: String,
    /// Lifecycle status.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub status: String,
    /// Attempts consumed.
    #[diesel(sql_type = diesel::sql_types::Int4)]
    pub attempt: i32,
    /// Attempt budget.
    #[diesel(sql_type = diesel::sql_types::Int4)]
    pub max_attempts: i32,
    /// Stage payload.
    #[diesel(sql_type = diesel::sql_types::Jsonb)]
    pub payload: Value,
    /// Latest failure description.
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Text>)]
    pub error_message: Option<String>,
    /// Earliest claim time while waiting on backoff.
    #[diesel(sql_type = diesel::sql_types::Nullable<diesel::sql_types::Timestamptz>)]
    pub available_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    #[diesel(sql_type = diesel::sql_types::Timestamptz)]
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    #[diesel(sql_type = diesel::sql_types::Timestamptz)]
    pub updated_at: DateTime<Utc>,
}

/// Insert model for task records.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = tasks)]
pub struct NewTaskRow {
    /// Internal task identifier.
    pub id: uuid::Uuid,
    /// Owning build.
    pub build_id: uuid::Uuid,
    /// Pipeline stage tag.
    pub task_type: String,
    /// Lifecycle status.
    pub status: String,
    /// Attempts consumed.
    pub attempt: i32,
    /// Attempt budget.
    pub max_attempts: i32,
    /// Stage payload.
    pub payload: Value,
    /// Latest failure description.
    pub error_message: Option<String>,
    /// Earliest claim time.
    pub available_at: Option<DateTime<Utc>>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Mutable task columns written back after a state change.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = tasks)]
#[diesel(treat_none_as_null = true)]
pub struct TaskChangeset {
    /// Lifecycle status.
    pub status: String,
    /// Attempts consumed.
    pub attempt: i32,
    /// Latest failure description.
    pub error_message: Option<String>,
    /// Earliest claim time.
    pub available_at: Option<DateTime<Utc>>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Row count grouped by status.
#[derive(Debug, Clone, QueryableByName)]
pub struct StatusCountRow {
    /// Status value.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub status: String,
    /// Row count.
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub count: i64,
}

/// Task count grouped by type and status.
#[derive(Debug, Clone, QueryableByName)]
pub struct TypeStatusCountRow {
    /// Pipeline stage tag.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub task_type: String,
    /// Status value.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub status: String,
    /// Row count.
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub count: i64,
}

/// Average completion duration for one task type.
#[derive(Debug, Clone, QueryableByName)]
pub struct CompletionRow {
    /// Pipeline stage tag.
    #[diesel(sql_type = diesel::sql_types::Varchar)]
    pub task_type: String,
    /// Completed tasks measured.
    #[diesel(sql_type = diesel::sql_types::BigInt)]
    pub completed: i64,
    /// Mean seconds from creation to completion.
    #[diesel(sql_type = diesel::sql_types::Double)]
    pub average_seconds: f64,
}

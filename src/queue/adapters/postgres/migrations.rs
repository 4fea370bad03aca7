//! Schema bootstrap for the queue tables.

use super::store::TaskPgPool;
use crate::queue::ports::{TaskStoreError, TaskStoreResult};
use diesel::connection::SimpleConnection;

const CREATE_BUILDS_AND_TASKS_SQL: &str =
    include_str!("../../../../migrations/2026-10-01-000000_create_builds_and_tasks/up.sql");

/// Applies every queue migration. Statements are idempotent, so calling this
/// on an already migrated database is a no-op.
///
/// # Errors
///
/// Returns [`TaskStoreError::Persistence`] when a connection cannot be
/// obtained or a statement fails.
pub async fn apply_migrations(pool: &TaskPgPool) -> TaskStoreResult<()> {
    let pool_handle = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut connection = pool_handle.get().map_err(TaskStoreError::persistence)?;
        connection
            .batch_execute(CREATE_BUILDS_AND_TASKS_SQL)
            .map_err(TaskStoreError::persistence)
    })
    .await
    .map_err(TaskStoreError::persistence)?
}

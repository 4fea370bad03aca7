//! Throwaway database provisioning for `PostgreSQL` integration tests.

use buildfix::queue::adapters::postgres::{PostgresTaskStore, TaskPgPool, apply_migrations};
use diesel::connection::SimpleConnection;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use std::sync::Arc;
use uuid::Uuid;

/// Server connection URL; its database is used only to create and drop
/// per-test databases.
pub const DATABASE_URL_ENV: &str = "BUILDFIX_TEST_DATABASE_URL";

/// A migrated database that is dropped when the value goes out of scope.
pub struct TestDatabase {
    server_url: String,
    name: String,
    pool: TaskPgPool,
}

impl TestDatabase {
    /// Creates and migrates a fresh database, or returns `None` when no test
    /// server is configured.
    pub async fn create() -> eyre::Result<Option<Self>> {
        let Ok(server_url) = std::env::var(DATABASE_URL_ENV) else {
            return Ok(None);
        };
        let name = format!("buildfix_test_{}", Uuid::new_v4().simple());
        let url = with_database(&server_url, &name);

        let create_url = server_url.clone();
        let create_sql = format!("CREATE DATABASE \"{name}\"");
        tokio::task::spawn_blocking(move || -> eyre::Result<()> {
            let mut connection = PgConnection::establish(&create_url)?;
            connection.batch_execute(&create_sql)?;
            Ok(())
        })
        .await??;

        let pool = Pool::builder()
            .max_size(8)
            .build(ConnectionManager::<PgConnection>::new(url))?;
        apply_migrations(&pool).await?;
        Ok(Some(Self {
            server_url,
            name,
            pool,
        }))
    }

    /// Returns a store over this database.
    pub fn store(&self) -> Arc<PostgresTaskStore> {
        Arc::new(PostgresTaskStore::new(self.pool.clone()))
    }
}

impl Drop for TestDatabase {
    fn drop(&mut self) {
        let drop_sql = format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name);
        let dropped = PgConnection::establish(&self.server_url)
            .map_err(|err| err.to_string())
            .and_then(|mut connection| {
                connection
                    .batch_execute(&drop_sql)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = dropped {
            tracing::warn!(database = %self.name, error = %err, "failed to drop test database");
        }
    }
}

/// Replaces the database path of `url` with `name`, keeping any query string.
fn with_database(url: &str, name: &str) -> String {
    let (base, query) = url
        .split_once('?')
        .map_or((url, None), |(head, tail)| (head, Some(tail)));
    let root = base.rsplit_once('/').map_or(base, |(head, _)| head);
    query.map_or_else(
        || format!("{root}/{name}"),
        |params| format!("{root}/{name}?{params}"),
    )
}

//! `PostgreSQL` adapters for build and task persistence.

mod migrations;
mod models;
mod schema;
mod store;

pub use migrations::apply_migrations;
pub use store::{PostgresTaskStore, TaskPgPool};

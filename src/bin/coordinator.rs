//! Runs the queue coordinator: schema bootstrap, stale task reconciliation,
//! and the admin HTTP surface.
//!
//! Usage:
//!
//! ```text
//! BUILDFIX_DATABASE_URL=postgres://localhost/buildfix buildfix-coordinator
//! ```
//!
//! Stage handlers are not hosted here. Applications embed
//! [`buildfix::pipeline::Orchestrator`] with their own registry and point it
//! at the same database.

use buildfix::admin::{AdminService, router};
use buildfix::config::{ConfigError, OrchestratorConfig};
use buildfix::queue::adapters::postgres::{PostgresTaskStore, TaskPgPool, apply_migrations};
use buildfix::queue::ports::TaskStoreError;
use buildfix::queue::services::{RetryHandler, StaleTaskReconciler, TaskQueueService};
use buildfix::telemetry::{self, TelemetryError};
use diesel::pg::PgConnection;
use diesel::r2d2::{ConnectionManager, Pool, PoolError};
use mockable::DefaultClock;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    #[error("failed to build connection pool: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to apply migrations: {0}")]
    Migrations(#[from] TaskStoreError),
    #[error("admin server failed: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), CoordinatorError> {
    let config = OrchestratorConfig::from_env()?;
    telemetry::init(config.log_format)?;

    let pool = build_pool(&config)?;
    apply_migrations(&pool).await?;
    info!(pool_size = config.db_pool_size, "queue schema ready");

    let store = Arc::new(PostgresTaskStore::new(pool));
    let queue = TaskQueueService::new(store, Arc::new(DefaultClock))
        .with_max_attempts(config.max_attempts);
    let retry = RetryHandler::new(queue, config.retry_policy());

    let shutdown = CancellationToken::new();
    let reconcile = config.reconcile_settings();
    let reconciler = StaleTaskReconciler::new(retry.clone(), reconcile.stale_after);
    let reconciler_token = shutdown.clone();
    let reconciler_task = tokio::spawn(async move {
        reconciler
            .run(reconcile.interval, &reconciler_token)
            .await;
    });

    let admin = AdminService::new(retry).with_pending_threshold(config.pending_threshold);
    let listener = TcpListener::bind(config.admin_bind).await?;
    info!(addr = %config.admin_bind, "admin server listening");

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to listen for shutdown signal");
        }
        info!("shutdown requested");
        signal_token.cancel();
    });

    let server_token = shutdown.clone();
    let served = axum::serve(listener, router(admin))
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;
    shutdown.cancel();

    if let Err(err) = reconciler_task.await {
        error!(error = %err, "reconciler task ended abnormally");
    }
    info!("coordinator stopped");
    served.map_err(CoordinatorError::from)
}

fn build_pool(config: &OrchestratorConfig) -> Result<TaskPgPool, CoordinatorError> {
    let manager = ConnectionManager::<PgConnection>::new(config.require_database_url()?);
    Ok(Pool::builder()
        .max_size(config.db_pool_size)
        .build(manager)?)
}

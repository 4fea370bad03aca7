//! Runs dispatchers for every registered stage plus stale task
//! reconciliation until shutdown.

use super::dispatcher::{DispatcherConfig, StageDispatcher};
use super::registry::HandlerRegistry;
use super::routing::StageRouter;
use crate::queue::{
    ports::TaskStore,
    services::{RetryHandler, StaleTaskReconciler},
};
use mockable::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Interval and threshold for stale task reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSettings {
    /// Age after which an `IN_PROGRESS` task counts as stalled.
    pub stale_after: Duration,
    /// Time between reconciliation passes.
    pub interval: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(1800),
            interval: Duration::from_secs(60),
        }
    }
}

/// Worker pool over a shared store: `workers_per_type` dispatchers for each
/// registered task type.
pub struct Orchestrator<S, C>
where
    S: TaskStore,
    C: Clock + Send + Sync,
{
    retry: RetryHandler<S, C>,
    registry: Arc<HandlerRegistry>,
    router: Arc<dyn StageRouter>,
    dispatcher_config: DispatcherConfig,
    workers_per_type: usize,
    reconcile: Option<ReconcileSettings>,
}

impl<S, C> Orchestrator<S, C>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    /// Creates an orchestrator with one worker per type and default
    /// reconciliation.
    #[must_use]
    pub fn new(
        retry: RetryHandler<S, C>,
        registry: HandlerRegistry,
        router: Arc<dyn StageRouter>,
    ) -> Self {
        Self {
            retry,
            registry: Arc::new(registry),
            router,
            dispatcher_config: DispatcherConfig::default(),
            workers_per_type: 1,
            reconcile: Some(ReconcileSettings::default()),
        }
    }

    /// Overrides poll and timeout settings.
    #[must_use]
    pub const fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Sets the number of concurrent dispatchers per task type (minimum 1).
    #[must_use]
    pub fn with_workers_per_type(mut self, workers: usize) -> Self {
        self.workers_per_type = workers.max(1);
        self
    }

    /// Overrides reconciliation settings; `None` disables reconciliation.
    #[must_use]
    pub const fn with_reconcile(mut self, settings: Option<ReconcileSettings>) -> Self {
        self.reconcile = settings;
        self
    }

    /// Builds every dispatcher this orchestrator would run.
    #[must_use]
    pub fn dispatchers(&self) -> Vec<StageDispatcher<S, C>> {
        self.registry
            .task_types()
            .flat_map(|task_type| {
                (0..self.workers_per_type).map(move |_| {
                    StageDispatcher::new(
                        task_type.clone(),
                        Arc::clone(&self.registry),
                        Arc::clone(&self.router),
                        self.retry.clone(),
                        self.dispatcher_config,
                    )
                })
            })
            .collect()
    }

    /// Runs all workers until `shutdown` is cancelled, then waits for them to
    /// finish their current task.
    pub async fn run(&self, shutdown: &CancellationToken) {
        let mut workers = JoinSet::new();
        for dispatcher in self.dispatchers() {
            let token = shutdown.clone();
            workers.spawn(async move { dispatcher.run(&token).await });
        }
        if let Some(settings) = self.reconcile {
            let reconciler = StaleTaskReconciler::new(self.retry.clone(), settings.stale_after);
            let token = shutdown.clone();
            workers.spawn(async move { reconciler.run(settings.interval, &token).await });
        }
        info!(workers = workers.len(), "orchestrator started");

        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker terminated abnormally");
            }
        }
        info!("orchestrator stopped");
    }
}

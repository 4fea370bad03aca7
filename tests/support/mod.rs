//! Stage handlers and a pipeline driver shared by integration tests.

use async_trait::async_trait;
use buildfix::pipeline::{
    DispatchError, DispatchOutcome, DispatcherConfig, HandlerError, HandlerRegistry,
    HandlerResult, LinearPipeline, RegistryError, StageDispatcher, StageRouter, TaskHandler,
};
use buildfix::queue::domain::{BuildSubmission, Payload, Task, TaskResult, TaskType};
use buildfix::queue::ports::TaskStore;
use buildfix::queue::services::{
    RetryHandler, RetryPolicy, SubmittedBuild, TaskQueueError, TaskQueueService,
};
use mockable::DefaultClock;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on polling rounds before [`Stack::drain`] gives up.
const MAX_ROUNDS: usize = 64;

/// Completes every task and records `<stage>_done` in the payload.
pub struct CompletingHandler;

#[async_trait]
impl TaskHandler for CompletingHandler {
    async fn handle(&self, task: &Task, _payload: &Payload) -> HandlerResult {
        let key = format!("{}_done", task.task_type().as_str().to_ascii_lowercase());
        Ok(TaskResult::completed(format!("{} finished", task.task_type())).with_metadata(key, true))
    }
}

/// How a [`FailingHandler`] fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Retryable infrastructure error.
    Transient,
    /// Non-retryable input error.
    Validation,
}

/// Fails every invocation with the configured class.
pub struct FailingHandler(pub Failure);

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn handle(&self, _task: &Task, _payload: &Payload) -> HandlerResult {
        Err(match self.0 {
            Failure::Transient => HandlerError::transient("runner lost connection"),
            Failure::Validation => HandlerError::validation("patch does not apply"),
        })
    }
}

/// Queue services plus one dispatcher per pipeline stage.
pub struct Stack<S: TaskStore + 'static> {
    pub queue: TaskQueueService<S, DefaultClock>,
    pub retry: RetryHandler<S, DefaultClock>,
    dispatchers: Vec<StageDispatcher<S, DefaultClock>>,
}

impl<S: TaskStore + 'static> Stack<S> {
    /// Builds a default six-stage pipeline over `store`. When `failing` is
    /// set, that stage's handler fails every attempt.
    pub fn new(store: Arc<S>, failing: Option<(TaskType, Failure)>) -> Result<Self, RegistryError> {
        let pipeline = LinearPipeline::default();
        let mut registry = HandlerRegistry::new();
        for stage in pipeline.stages() {
            match failing {
                Some((ref failing_stage, failure)) if failing_stage == stage => {
                    registry.register(stage.clone(), FailingHandler(failure))?;
                }
                _ => registry.register(stage.clone(), CompletingHandler)?,
            }
        }

        let queue = TaskQueueService::new(store, Arc::new(DefaultClock));
        let retry = RetryHandler::new(
            queue.clone(),
            RetryPolicy {
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: None,
            },
        );
        let shared = Arc::new(registry);
        let router: Arc<dyn StageRouter> = Arc::new(pipeline.clone());
        let config = DispatcherConfig {
            poll_interval: Duration::from_millis(10),
            handler_timeout: Duration::from_secs(5),
        };
        let dispatchers = pipeline
            .stages()
            .iter()
            .map(|stage| {
                StageDispatcher::new(
                    stage.clone(),
                    Arc::clone(&shared),
                    Arc::clone(&router),
                    retry.clone(),
                    config,
                )
            })
            .collect();
        Ok(Self {
            queue,
            retry,
            dispatchers,
        })
    }

    /// Submits build `build_number` of job `acme-app`.
    pub async fn submit(&self, build_number: u64) -> Result<SubmittedBuild, TaskQueueError> {
        self.queue
            .submit_build(
                BuildSubmission::new("acme-app", build_number)
                    .with_branch("main")
                    .with_repo_url("https://git.example.com/acme/app.git"),
                TaskType::PLAN,
            )
            .await
    }

    /// Polls every dispatcher until a full round finds no work.
    pub async fn drain(&self) -> Result<Vec<DispatchOutcome>, DispatchError> {
        let mut outcomes = Vec::new();
        for _ in 0..MAX_ROUNDS {
            let mut idle = true;
            for dispatcher in &self.dispatchers {
                let outcome = dispatcher.poll_once().await?;
                if outcome != DispatchOutcome::Idle {
                    idle = false;
                    outcomes.push(outcome);
                }
            }
            if idle {
                break;
            }
        }
        Ok(outcomes)
    }
}

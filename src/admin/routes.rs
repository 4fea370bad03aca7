//! Axum routes for the admin surface.

use super::service::{AdminService, AdminStatus, HealthReport, ManualRetry};
use crate::queue::{
    domain::{Build, BuildId, Task, TaskId, TaskStatus},
    ports::{Page, PageRequest, QueueStats, TaskQuery, TaskStore},
    services::BuildRetrySummary,
};
use axum::{
    Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
};
use mockable::Clock;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use uuid::Uuid;

type AdminState<S, C> = State<Arc<AdminService<S, C>>>;
type JsonResult<T> = Result<Json<T>, StatusCode>;

pub(crate) fn internal(e: impl std::fmt::Display) -> StatusCode {
    tracing::error!("admin request failed: {e}");
    StatusCode::INTERNAL_SERVER_ERROR
}

#[derive(Debug, Deserialize)]
pub(crate) struct PageParams {
    page: Option<u32>,
    size: Option<u32>,
}

fn page_request(page: Option<u32>, size: Option<u32>) -> PageRequest {
    PageRequest::new(
        page.unwrap_or(0),
        size.unwrap_or(PageRequest::DEFAULT_SIZE),
    )
}

#[derive(Debug, Deserialize)]
pub(crate) struct TaskListParams {
    status: Option<String>,
    page: Option<u32>,
    size: Option<u32>,
}

/// Builds the admin router over `service`.
pub fn router<S, C>(service: AdminService<S, C>) -> Router
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    Router::new()
        .route("/admin/status", get(status::<S, C>))
        .route("/admin/health", get(health::<S, C>))
        .route("/admin/tasks", get(list_tasks::<S, C>))
        .route("/admin/tasks/:id", get(get_task::<S, C>))
        .route("/admin/tasks/:id/retry", post(retry_task::<S, C>))
        .route("/admin/builds", get(list_builds::<S, C>))
        .route("/admin/builds/:id", get(get_build::<S, C>))
        .route("/admin/builds/:id/tasks", get(build_tasks::<S, C>))
        .route("/admin/builds/:id/retry", post(retry_build::<S, C>))
        .route("/admin/queue/stats", get(queue_stats::<S, C>))
        .with_state(Arc::new(service))
}

async fn status<S, C>(State(admin): AdminState<S, C>) -> JsonResult<AdminStatus>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin.status().await.map(Json).map_err(internal)
}

async fn health<S, C>(State(admin): AdminState<S, C>) -> JsonResult<HealthReport>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin.health().await.map(Json).map_err(internal)
}

async fn list_tasks<S, C>(
    State(admin): AdminState<S, C>,
    Query(params): Query<TaskListParams>,
) -> JsonResult<Page<Task>>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    let status = params
        .status
        .as_deref()
        .filter(|value| !value.trim().is_empty())
        .map(TaskStatus::try_from)
        .transpose()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let query = TaskQuery {
        status,
        build_id: None,
    };
    admin
        .list_tasks(&query, page_request(params.page, params.size))
        .await
        .map(Json)
        .map_err(internal)
}

async fn get_task<S, C>(State(admin): AdminState<S, C>, Path(id): Path<Uuid>) -> JsonResult<Task>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin
        .task(TaskId::from_uuid(id))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn retry_task<S, C>(State(admin): AdminState<S, C>, Path(id): Path<Uuid>) -> JsonResult<Value>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    let task_id = TaskId::from_uuid(id);
    match admin.retry_task(task_id).await.map_err(internal)? {
        ManualRetry::Requeued => Ok(Json(json!({
            "task_id": task_id,
            "status": TaskStatus::Pending,
        }))),
        ManualRetry::NotFound => Err(StatusCode::NOT_FOUND),
        ManualRetry::NotFailed(current) => {
            tracing::warn!(
                task_id = %task_id,
                status = %current,
                "rejected retry of non-failed task"
            );
            Err(StatusCode::BAD_REQUEST)
        }
    }
}

async fn list_builds<S, C>(
    State(admin): AdminState<S, C>,
    Query(params): Query<PageParams>,
) -> JsonResult<Page<Build>>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin
        .list_builds(page_request(params.page, params.size))
        .await
        .map(Json)
        .map_err(internal)
}

async fn get_build<S, C>(State(admin): AdminState<S, C>, Path(id): Path<Uuid>) -> JsonResult<Build>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin
        .build(BuildId::from_uuid(id))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn build_tasks<S, C>(
    State(admin): AdminState<S, C>,
    Path(id): Path<Uuid>,
) -> JsonResult<Vec<Task>>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin
        .build_tasks(BuildId::from_uuid(id))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn retry_build<S, C>(
    State(admin): AdminState<S, C>,
    Path(id): Path<Uuid>,
) -> JsonResult<BuildRetrySummary>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin
        .retry_build(BuildId::from_uuid(id))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn queue_stats<S, C>(State(admin): AdminState<S, C>) -> JsonResult<QueueStats>
where
    S: TaskStore + 'static,
    C: Clock + Send + Sync + 'static,
{
    admin.queue_stats().await.map(Json).map_err(internal)
}

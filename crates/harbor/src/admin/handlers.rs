//! Axum handlers for the admin surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::protocol::{ErrorResponse, TaskResponse};
use common::ServiceError;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use super::health::{run_checks, HealthCheck};
use super::task::Task;

/// Per-request timeout on admin routes.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AdminState {
    pub tasks: Arc<BTreeMap<String, Arc<dyn Task>>>,
    pub health_checks: Arc<BTreeMap<String, Arc<dyn HealthCheck>>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/tasks/:name", post(run_task))
        .route("/healthcheck", get(healthcheck))
        .route("/ping", get(ping))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

/// `POST /tasks/{name}`: run a registered task with the query parameters.
pub async fn run_task(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Response {
    let Some(task) = state.tasks.get(&name) else {
        return error_response(ServiceError::NotFound(format!("task `{name}`")));
    };
    info!(task = %name, ?params, "running task");
    match task.execute(&params).await {
        Ok(output) => (StatusCode::OK, Json(TaskResponse { task: name, output })).into_response(),
        Err(e) => {
            warn!(task = %name, error = %format!("{e:#}"), "task failed");
            match e.downcast::<ServiceError>() {
                Ok(service_error) => error_response(service_error),
                Err(e) => error_response(ServiceError::TaskFailed(format!("{e:#}"))),
            }
        }
    }
}

/// `GET /healthcheck`: `200` when every check passes, `500` otherwise.
pub async fn healthcheck(State(state): State<AdminState>) -> Response {
    let response = run_checks(&state.health_checks).await;
    let status = if response.all_healthy() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(response)).into_response()
}

/// `GET /ping`
pub async fn ping() -> &'static str {
    "pong\n"
}

pub async fn not_found() -> Response {
    error_response(ServiceError::NotFound(
        "the requested admin resource does not exist".into(),
    ))
}

pub(crate) fn error_response(err: ServiceError) -> Response {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::from(&err))).into_response()
}

//! Minimal health/introspection HTTP surface (§2 composition root) — start,
//! pause, resume, cancel a run, and query queue/run state. Deliberately not
//! the excluded graph API: there is no session, workspace, or tool surface
//! here, only the evaluation pipeline's own state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use evalkit_core::{EvalError, JobIntrospection, RunController, StartRunInput};
use evalkit_types::{ExperimentId, Priority, Run, RunId};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/runs", post(start_run))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/queues/{name}/stats", get(queue_stats))
        .route("/queues/{name}/failures", get(queue_failures))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    definition_id: evalkit_types::DefinitionId,
    experiment_id: Option<ExperimentId>,
    model_ids: Vec<String>,
    sample_percentage: u32,
    sample_seed: Option<u64>,
    #[serde(default = "default_priority")]
    priority: Priority,
    created_by: String,
    cost_estimate: Option<f64>,
}

fn default_priority() -> Priority {
    Priority::Normal
}

async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartRunRequest>,
) -> Result<Json<Run>, ApiError> {
    let run = state
        .controller
        .start_run(StartRunInput {
            definition_id: body.definition_id,
            experiment_id: body.experiment_id,
            model_ids: body.model_ids,
            sample_percentage: body.sample_percentage,
            sample_seed: body.sample_seed,
            priority: body.priority,
            created_by: body.created_by,
            cost_estimate: body.cost_estimate,
        })
        .await?;
    Ok(Json(run))
}

async fn get_run(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<RunId>) -> Result<Json<Run>, ApiError> {
    Ok(Json(state.storage.get_run(id).await?))
}

async fn pause_run(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<RunId>) -> Result<Json<Run>, ApiError> {
    Ok(Json(transition(&state.controller, id, Transition::Pause).await?))
}

async fn resume_run(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<RunId>) -> Result<Json<Run>, ApiError> {
    Ok(Json(transition(&state.controller, id, Transition::Resume).await?))
}

async fn cancel_run(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<RunId>) -> Result<Json<Run>, ApiError> {
    Ok(Json(transition(&state.controller, id, Transition::Cancel).await?))
}

enum Transition {
    Pause,
    Resume,
    Cancel,
}

async fn transition(controller: &RunController, id: RunId, which: Transition) -> Result<Run, EvalError> {
    match which {
        Transition::Pause => controller.pause(id).await,
        Transition::Resume => controller.resume(id).await,
        Transition::Cancel => controller.cancel(id).await,
    }
}

#[derive(Debug, Deserialize)]
struct FailureQuery {
    payload_field: Option<String>,
    payload_value: Option<String>,
    limit: Option<usize>,
}

async fn queue_stats(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
) -> Result<Json<evalkit_queue::QueueStats>, ApiError> {
    let stats = state.queue.queue_stats(&name).await.map_err(ApiError::internal)?;
    Ok(Json(stats))
}

async fn queue_failures(
    State(state): State<Arc<AppState>>,
    AxumPath(name): AxumPath<String>,
    Query(query): Query<FailureQuery>,
) -> Result<Json<Vec<evalkit_queue::RecentFailure>>, ApiError> {
    let failures = state
        .queue
        .recent_failures(
            &name,
            query.payload_field.as_deref(),
            query.payload_value.as_deref(),
            query.limit.unwrap_or(20),
        )
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(failures))
}

/// Maps the error taxonomy (§7) onto HTTP status codes without leaking
/// internal detail past the category + message the spec allows callers.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "unhandled internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<EvalError> for ApiError {
    fn from(err: EvalError) -> Self {
        let status = match &err {
            EvalError::NotFound(_) => StatusCode::NOT_FOUND,
            EvalError::Validation(_) => StatusCode::BAD_REQUEST,
            EvalError::RunState(_) => StatusCode::CONFLICT,
            EvalError::Retryable(_) => StatusCode::SERVICE_UNAVAILABLE,
            EvalError::NonRetryable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EvalError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "unhandled internal error");
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

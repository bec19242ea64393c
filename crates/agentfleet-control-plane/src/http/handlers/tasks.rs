//! Task run API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::info;

use agentfleet_core::{NewRun, RunId};

use crate::http::error::ApiError;
use crate::http::responses::{SubmitResponse, TaskResponse};
use crate::state::AppState;

/// Submit a task run.
pub async fn submit_task(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NewRun>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.submit(req).await?;
    info!(run_id = %run.id, status = %run.status, "Task submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            run_id: run.id.to_string(),
            status: run.status.to_string(),
        }),
    ))
}

/// List task runs, newest first.
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<TaskResponse>>, ApiError> {
    let mut runs = state.orchestrator.list_runs().await?;
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(Json(runs.iter().map(TaskResponse::from).collect()))
}

pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let run = state.orchestrator.get_status(&RunId::new(run_id)).await?;
    Ok(Json(TaskResponse::from(&run)))
}

/// Start a draft or dependency-blocked run.
pub async fn start_task(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.start(&RunId::new(run_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(&run))))
}

pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<TaskResponse>, ApiError> {
    let run = state.orchestrator.cancel(&RunId::new(run_id)).await?;
    Ok(Json(TaskResponse::from(&run)))
}

/// Retry a failed or cancelled run.
pub async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.retry(&RunId::new(run_id)).await?;
    Ok((StatusCode::ACCEPTED, Json(TaskResponse::from(&run))))
}

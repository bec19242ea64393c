//! Callbacks from remote agents.
//!
//! All three routes authenticate with the per-workspace callback token passed
//! as a bearer token.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};

use agentfleet_core::protocol::{ProvisioningFailedRequest, StatusCallbackRequest};
use agentfleet_core::{RunId, WorkspaceId};

use crate::http::error::{bearer_token, ApiError};
use crate::http::responses::TaskResponse;
use crate::state::AppState;

/// Workspace finished provisioning.
pub async fn workspace_ready(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers)?;
    state
        .orchestrator
        .handle_workspace_ready(&WorkspaceId::new(workspace_id), token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Workspace could not be provisioned.
pub async fn workspace_provisioning_failed(
    State(state): State<Arc<AppState>>,
    Path(workspace_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ProvisioningFailedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let token = bearer_token(&headers)?;
    state
        .orchestrator
        .handle_workspace_failed(&WorkspaceId::new(workspace_id), token, &req.reason)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Terminal status reported by an agent session.
pub async fn status_callback(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<StatusCallbackRequest>,
) -> Result<Json<TaskResponse>, ApiError> {
    let token = bearer_token(&headers)?;
    let run = state
        .orchestrator
        .handle_status_callback(&RunId::new(run_id), token, req)
        .await?;
    Ok(Json(TaskResponse::from(&run)))
}

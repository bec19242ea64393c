//! HTTP server for the agent.
//!
//! Provides endpoints for:
//! - Health check (`/health`)
//! - Workspaces (`/workspaces`, `/workspaces/:id`)
//! - Agent sessions (`/workspaces/:id/agent-sessions[/:sid/start]`)

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use agentfleet_core::protocol::{
    AgentHealth, CreateSessionRequest, CreateWorkspaceRequest, StartSessionRequest,
};
use agentfleet_core::{SessionId, WorkspaceId};

use crate::agent::{Agent, AgentError};

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        let status = match &self {
            AgentError::WorkspaceNotFound(_) | AgentError::SessionNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            AgentError::Conflict(_) => StatusCode::CONFLICT,
            AgentError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AgentError::Launch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Create the HTTP router.
pub fn create_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/workspaces", post(create_workspace))
        .route("/workspaces/:id", delete(stop_workspace))
        .route("/workspaces/:id/agent-sessions", post(create_session))
        .route(
            "/workspaces/:id/agent-sessions/:sid/start",
            post(start_session),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn health_check(State(agent): State<Arc<Agent>>) -> impl IntoResponse {
    Json(AgentHealth {
        status: "ok".to_string(),
        node_id: agent.node_id().cloned(),
    })
}

async fn create_workspace(
    State(agent): State<Arc<Agent>>,
    Json(req): Json<CreateWorkspaceRequest>,
) -> Result<impl IntoResponse, AgentError> {
    let workspace_id = req.workspace_id.clone();
    let created = agent.create_workspace(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "workspaceId": workspace_id, "created": created })),
    ))
}

async fn stop_workspace(
    State(agent): State<Arc<Agent>>,
    Path(workspace_id): Path<String>,
) -> Result<StatusCode, AgentError> {
    agent.stop_workspace(&WorkspaceId::new(workspace_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_session(
    State(agent): State<Arc<Agent>>,
    Path(workspace_id): Path<String>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, AgentError> {
    let session_id = req.session_id.clone();
    agent
        .register_session(&WorkspaceId::new(workspace_id), req)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "sessionId": session_id })),
    ))
}

async fn start_session(
    State(agent): State<Arc<Agent>>,
    Path((workspace_id, session_id)): Path<(String, String)>,
    Json(req): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, AgentError> {
    let response = agent
        .start_session(
            &WorkspaceId::new(workspace_id),
            &SessionId::new(session_id),
            req,
        )
        .await?;
    Ok(Json(response))
}

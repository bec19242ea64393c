//! HTTP server for the control plane.
//!
//! Provides endpoints for:
//! - Task runs (`/v1/tasks`)
//! - Node list API (`/v1/nodes`)
//! - Agent callbacks (`/workspaces/:id/...`, `/tasks/:id/status/callback`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub mod error;
mod handlers;
pub mod responses;

pub use error::ApiError;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // API routes
        .route(
            "/v1/tasks",
            get(handlers::list_tasks).post(handlers::submit_task),
        )
        .route("/v1/tasks/:id", get(handlers::get_task))
        .route("/v1/tasks/:id/start", post(handlers::start_task))
        .route("/v1/tasks/:id/cancel", post(handlers::cancel_task))
        .route("/v1/tasks/:id/retry", post(handlers::retry_task))
        .route("/v1/nodes", get(handlers::list_nodes))
        // Agent callbacks
        .route("/workspaces/:id/ready", post(handlers::workspace_ready))
        .route(
            "/workspaces/:id/provisioning-failed",
            post(handlers::workspace_provisioning_failed),
        )
        .route(
            "/tasks/:id/status/callback",
            post(handlers::status_callback),
        )
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

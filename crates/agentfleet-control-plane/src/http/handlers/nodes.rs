//! Node list handler.

use std::sync::Arc;

use axum::{extract::State, Json};

use crate::http::error::ApiError;
use crate::http::responses::NodeResponse;
use crate::state::AppState;

/// List nodes as JSON.
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<NodeResponse>>, ApiError> {
    let mut nodes = state.store.list_nodes(None).await?;
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(Json(nodes.iter().map(NodeResponse::from).collect()))
}

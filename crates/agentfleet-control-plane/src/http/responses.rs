//! HTTP request and response types.

use serde::{Deserialize, Serialize};

use agentfleet_core::{Node, TaskRun};

// ============================================================================
// Error types
// ============================================================================

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Task types
// ============================================================================

/// Response body for a task submission.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub run_id: String,
    pub status: String,
}

/// Externally visible view of a task run.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResponse {
    pub run_id: String,
    pub status: String,
    pub execution_step: Option<String>,
    pub error: Option<String>,
    pub node_id: Option<String>,
    pub workspace_id: Option<String>,
    pub agent_session_id: Option<String>,
    pub output_summary: Option<String>,
    pub output_branch: Option<String>,
    pub attempt: u32,
}

impl From<&TaskRun> for TaskResponse {
    fn from(run: &TaskRun) -> Self {
        Self {
            run_id: run.id.to_string(),
            status: run.status.to_string(),
            execution_step: run.execution_step.map(|s| s.to_string()),
            error: run.error_message.clone(),
            node_id: run.node_id.as_ref().map(|id| id.to_string()),
            workspace_id: run.workspace_id.as_ref().map(|id| id.to_string()),
            agent_session_id: run.agent_session_id.as_ref().map(|id| id.to_string()),
            output_summary: run.output_summary.clone(),
            output_branch: run.output_branch.clone(),
            attempt: run.attempt,
        }
    }
}

// ============================================================================
// Node types
// ============================================================================

/// Response for a single node.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResponse {
    pub node_id: String,
    pub status: String,
    pub phase: String,
    pub address: Option<String>,
    pub size: String,
    pub location: String,
    pub active_workspaces: u32,
    pub max_workspaces: u32,
    pub auto_provisioned: bool,
    pub last_heartbeat: Option<String>,
    pub warm_since: Option<String>,
}

impl From<&Node> for NodeResponse {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.id.to_string(),
            status: node.status.to_string(),
            phase: node.phase.to_string(),
            address: node.address.clone(),
            size: node.size.clone(),
            location: node.location.clone(),
            active_workspaces: node.active_workspaces,
            max_workspaces: node.max_workspaces,
            auto_provisioned: node.auto_provisioned,
            last_heartbeat: node.last_heartbeat.map(|t| t.to_rfc3339()),
            warm_since: node.warm_since.map(|t| t.to_rfc3339()),
        }
    }
}

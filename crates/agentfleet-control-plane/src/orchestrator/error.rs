//! Orchestrator error types.

use std::time::Duration;

use thiserror::Error;

use agentfleet_core::{CoreError, ExecutionStep, NodeId, RunId, RunStatus, WorkspaceId};

use crate::node_lifecycle::NodeError;
use crate::store::StoreError;

/// Why an execution stopped before `in_progress`.
///
/// Execution runs detached, so these are never returned to a caller: they
/// are persisted on the run as [`ExecutionError::persisted_message`].
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("node {node_id} not healthy after {waited:?}")]
    ProvisioningTimeout { node_id: NodeId, waited: Duration },

    #[error("{0}")]
    ProvisioningFailed(String),

    #[error("{0}")]
    WorkspaceCreationFailed(String),

    #[error("workspace {workspace_id} not ready after {waited:?}")]
    WorkspaceTimeout {
        workspace_id: WorkspaceId,
        waited: Duration,
    },

    #[error("{0}")]
    AgentSessionStartFailed(String),

    #[error("run stuck in {status} for {elapsed_secs}s")]
    StuckRunRecovered { status: RunStatus, elapsed_secs: i64 },

    #[error("node {0} has no free workspace slot")]
    NodeCapacityExceeded(NodeId),

    #[error("node {0} is not running")]
    PreferredNodeUnavailable(NodeId),

    #[error("dependencies not completed: {}", join_ids(.0))]
    DependenciesIncomplete(Vec<RunId>),

    /// A conditional write lost; someone else owns the run now.
    #[error("run superseded by a concurrent transition")]
    Superseded,

    #[error(transparent)]
    Store(#[from] StoreError),
}

fn join_ids(ids: &[RunId]) -> String {
    ids.iter()
        .map(RunId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl ExecutionError {
    /// Stable name of the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::ProvisioningTimeout { .. } => "ProvisioningTimeout",
            ExecutionError::ProvisioningFailed(_) => "ProvisioningFailed",
            ExecutionError::WorkspaceCreationFailed(_) => "WorkspaceCreationFailed",
            ExecutionError::WorkspaceTimeout { .. } => "WorkspaceTimeout",
            ExecutionError::AgentSessionStartFailed(_) => "AgentSessionStartFailed",
            ExecutionError::StuckRunRecovered { .. } => "StuckRunRecovered",
            ExecutionError::NodeCapacityExceeded(_) => "NodeCapacityExceeded",
            ExecutionError::PreferredNodeUnavailable(_) => "PreferredNodeUnavailable",
            ExecutionError::DependenciesIncomplete(_) => "DependenciesIncomplete",
            ExecutionError::Superseded => "Superseded",
            ExecutionError::Store(_) => "StoreError",
        }
    }

    /// Message written to the run: `"<Kind>: <detail> (execution step: <step>)"`.
    pub fn persisted_message(&self, step: Option<ExecutionStep>) -> String {
        format!(
            "{}: {} (execution step: {})",
            self.kind(),
            self,
            step.map_or("none", |s| s.as_str())
        )
    }
}

impl From<NodeError> for ExecutionError {
    fn from(e: NodeError) -> Self {
        match e {
            NodeError::HealthTimeout { node_id, waited } => {
                ExecutionError::ProvisioningTimeout { node_id, waited }
            }
            NodeError::Store(e) => ExecutionError::Store(e),
            other => ExecutionError::ProvisioningFailed(other.to_string()),
        }
    }
}

/// Errors returned to callers of the orchestrator's synchronous API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(WorkspaceId),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("dependencies not completed: {}", join_ids(.0))]
    DependenciesIncomplete(Vec<RunId>),

    /// The run changed underneath the request.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid or expired callback token")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persisted_message_embeds_step() {
        let err = ExecutionError::AgentSessionStartFailed("agent returned 500".into());
        assert_eq!(
            err.persisted_message(Some(ExecutionStep::AgentSession)),
            "AgentSessionStartFailed: agent returned 500 (execution step: agent_session)"
        );
        assert_eq!(
            ExecutionError::Superseded.persisted_message(None),
            "Superseded: run superseded by a concurrent transition (execution step: none)"
        );
    }

    #[test]
    fn test_health_timeout_maps_to_provisioning_timeout() {
        let err: ExecutionError = NodeError::HealthTimeout {
            node_id: NodeId::new("n1"),
            waited: Duration::from_secs(300),
        }
        .into();
        assert_eq!(err.kind(), "ProvisioningTimeout");
    }
}

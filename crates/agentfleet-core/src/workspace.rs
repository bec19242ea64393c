//! Workspace and agent session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{NodeId, RunId, SessionId, SessionStatus, WorkspaceId, WorkspaceStatus};

/// An isolated execution context for one task run, on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: WorkspaceId,
    pub node_id: NodeId,
    pub run_id: RunId,
    pub status: WorkspaceStatus,
    pub repository: String,
    pub branch: String,
    pub ready_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// SHA-256 hex digest of the callback token issued for this workspace.
    #[serde(skip_serializing)]
    pub callback_token_hash: Option<String>,
    pub callback_token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workspace {
    /// Create a workspace record in `creating`.
    pub fn new(
        node_id: NodeId,
        run_id: RunId,
        repository: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: WorkspaceId::generate(),
            node_id,
            run_id,
            status: WorkspaceStatus::Creating,
            repository: repository.into(),
            branch: branch.into(),
            ready_at: None,
            error_message: None,
            callback_token_hash: None,
            callback_token_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The autonomous worker process inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSession {
    pub id: SessionId,
    pub workspace_id: WorkspaceId,
    pub status: SessionStatus,
    pub label: String,
    /// Instruction the session was (or will be) started with.
    pub instruction: String,
    pub created_at: DateTime<Utc>,
    /// Set only once the start call succeeded.
    pub started_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    /// Create a session record in `created`; nothing runs until it is started.
    pub fn new(
        workspace_id: WorkspaceId,
        label: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            id: SessionId::generate(),
            workspace_id,
            status: SessionStatus::Created,
            label: label.into(),
            instruction: instruction.into(),
            created_at: Utc::now(),
            started_at: None,
        }
    }
}

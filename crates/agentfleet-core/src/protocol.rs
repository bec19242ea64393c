//! Wire types exchanged between the control plane and remote agents.
//!
//! Bodies are camelCase JSON. Creating an agent session and starting it are
//! separate requests: only [`StartSessionRequest`] carries the instruction.

use serde::{Deserialize, Serialize};

use crate::{NodeId, RunId, RunStatus, SessionId, WorkspaceId};

/// `GET /health` on a remote agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealth {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// `POST /workspaces`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceRequest {
    pub workspace_id: WorkspaceId,
    pub repository: String,
    pub branch: String,
    /// Base for `/{workspaceId}/ready` and `/{workspaceId}/provisioning-failed`.
    pub callback_url: String,
    pub callback_token: String,
}

/// `POST /workspaces/:id/agent-sessions`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub session_id: SessionId,
    pub label: String,
}

/// `POST /workspaces/:id/agent-sessions/:sid/start`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub instruction: String,
    pub run_id: RunId,
    /// Where the agent posts the run's terminal status.
    pub callback_url: String,
    pub callback_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: SessionId,
    pub already_started: bool,
}

/// `POST /workspaces/:id/provisioning-failed`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFailedRequest {
    #[serde(default)]
    pub reason: String,
}

/// `POST /tasks/:id/status/callback`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCallbackRequest {
    pub to_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_branch: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_request_carries_instruction() {
        let request = StartSessionRequest {
            instruction: "fix bug X".into(),
            run_id: RunId::new("r1"),
            callback_url: "http://cp/tasks/r1/status/callback".into(),
            callback_token: "tok".into(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["instruction"], "fix bug X");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["callbackToken"], "tok");
    }

    #[test]
    fn test_status_callback_parses_snake_case_status() {
        let request: StatusCallbackRequest = serde_json::from_str(
            r#"{"toStatus":"completed","outputSummary":"done","outputBranch":"agent/r1"}"#,
        )
        .unwrap();
        assert_eq!(request.to_status, RunStatus::Completed);
        assert_eq!(request.output_branch.as_deref(), Some("agent/r1"));

        let minimal: StatusCallbackRequest =
            serde_json::from_str(r#"{"toStatus":"failed"}"#).unwrap();
        assert_eq!(minimal.output_summary, None);
    }
}

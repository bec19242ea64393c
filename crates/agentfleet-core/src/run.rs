//! Task run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, ExecutionStep, NodeId, RunId, RunStatus, SessionId, WorkspaceId};

/// Default branch checked out when a submission does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// Parameters of a task-run submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRun {
    /// Instruction text handed to the agent session when it starts.
    pub instruction: String,
    /// Repository the workspace is created from.
    pub repository: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub preferred_node_id: Option<NodeId>,
    /// Required node size; `None` accepts the configured default.
    #[serde(default)]
    pub node_size: Option<String>,
    #[serde(default)]
    pub node_location: Option<String>,
    /// Runs that must be `completed` before this one may start.
    #[serde(default)]
    pub depends_on: Vec<RunId>,
    /// Create the run in `draft` instead of `ready`.
    #[serde(default)]
    pub draft: bool,
}

impl NewRun {
    /// Create a submission for `instruction` against `repository`.
    pub fn new(instruction: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            repository: repository.into(),
            ..Default::default()
        }
    }

    /// Builder method to pin the run to a node.
    pub fn with_preferred_node(mut self, node_id: NodeId) -> Self {
        self.preferred_node_id = Some(node_id);
        self
    }

    /// Builder method to add a dependency.
    pub fn with_dependency(mut self, run_id: RunId) -> Self {
        self.depends_on.push(run_id);
        self
    }

    /// Reject submissions that could never execute.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.instruction.trim().is_empty() {
            return Err(CoreError::InvalidInput("instruction is required".into()));
        }
        if self.repository.trim().is_empty() {
            return Err(CoreError::InvalidInput("repository is required".into()));
        }
        Ok(())
    }
}

/// One execution attempt of a unit of instructed work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    pub id: RunId,
    pub status: RunStatus,
    /// Last-begun execution stage; `None` until execution starts.
    pub execution_step: Option<ExecutionStep>,
    pub node_id: Option<NodeId>,
    pub workspace_id: Option<WorkspaceId>,
    pub agent_session_id: Option<SessionId>,
    /// Immutable instruction text.
    pub instruction: String,
    pub repository: String,
    pub branch: String,
    pub preferred_node_id: Option<NodeId>,
    pub node_size: Option<String>,
    pub node_location: Option<String>,
    pub depends_on: Vec<RunId>,
    pub created_at: DateTime<Utc>,
    /// Bumped on every write, including breadcrumbs.
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_summary: Option<String>,
    pub output_branch: Option<String>,
    /// The node was provisioned for this run rather than claimed.
    pub auto_provisioned_node: bool,
    /// Number of fresh executions started from `ready`; zero before the first.
    pub attempt: u32,
}

impl TaskRun {
    /// Create a run record from a submission.
    pub fn new(request: NewRun) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            status: if request.draft {
                RunStatus::Draft
            } else {
                RunStatus::Ready
            },
            execution_step: None,
            node_id: None,
            workspace_id: None,
            agent_session_id: None,
            instruction: request.instruction,
            repository: request.repository,
            branch: request.branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            preferred_node_id: request.preferred_node_id,
            node_size: request.node_size,
            node_location: request.node_location,
            depends_on: request.depends_on,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
            output_summary: None,
            output_branch: None,
            auto_provisioned_node: false,
            attempt: 0,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: RunId) -> Self {
        self.id = id;
        self
    }

    /// Check if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Execution step as a string, `"none"` before execution begins.
    pub fn step_label(&self) -> &'static str {
        self.execution_step.map(|s| s.as_str()).unwrap_or("none")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_defaults() {
        let run = TaskRun::new(NewRun::new("fix bug X", "https://example.com/repo.git"));
        assert_eq!(run.status, RunStatus::Ready);
        assert_eq!(run.branch, "main");
        assert!(run.execution_step.is_none());
        assert_eq!(run.step_label(), "none");
        assert_eq!(run.attempt, 0);
    }

    #[test]
    fn test_draft_submission() {
        let mut request = NewRun::new("x", "repo");
        request.draft = true;
        assert_eq!(TaskRun::new(request).status, RunStatus::Draft);
    }

    #[test]
    fn test_validate_rejects_blank_instruction() {
        assert!(NewRun::new("   ", "repo").validate().is_err());
        assert!(NewRun::new("do it", "").validate().is_err());
        assert!(NewRun::new("do it", "repo").validate().is_ok());
    }

    #[test]
    fn test_submission_wire_format() {
        let json = r#"{"instruction":"fix","repository":"r","preferredNodeId":"n1"}"#;
        let request: NewRun = serde_json::from_str(json).unwrap();
        assert_eq!(request.preferred_node_id, Some(NodeId::new("n1")));
        assert!(request.depends_on.is_empty());
    }
}

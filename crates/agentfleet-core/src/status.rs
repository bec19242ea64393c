//! Status enums for task runs, nodes, workspaces and agent sessions.
//!
//! All of these are persisted as lowercase snake_case strings, which is also
//! their wire representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// The persisted string form.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(CoreError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Status of a task run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but held back from execution.
    Draft,
    /// Eligible to start once dependencies complete.
    #[default]
    Ready,
    /// Accepted for execution; the orchestrator is acquiring a node.
    Queued,
    /// A workspace has been requested on a node.
    Delegated,
    /// The agent session was started with its instruction.
    InProgress,
    /// The agent reported success.
    Completed,
    /// Execution failed or was force-failed by the recovery sweep.
    Failed,
    /// Cancelled by a user.
    Cancelled,
}

string_enum!(RunStatus, "run status", {
    Draft => "draft",
    Ready => "ready",
    Queued => "queued",
    Delegated => "delegated",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RunStatus {
    /// Returns true if the run is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns true while the orchestrator (or the sweep) owns the run.
    pub fn is_executing(&self) -> bool {
        matches!(self, Self::Queued | Self::Delegated | Self::InProgress)
    }

    /// Whether `self -> to` is an edge of the run state machine.
    pub fn can_transition_to(&self, to: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, to),
            (Draft, Ready)
                | (Ready, Queued)
                | (Ready, Cancelled)
                | (Queued, Delegated)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (Delegated, InProgress)
                | (Delegated, Failed)
                | (Delegated, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Failed, Ready)
                | (Cancelled, Ready)
        )
    }

    /// Statuses from which a transition to `to` is allowed.
    pub fn sources_of(to: RunStatus) -> Vec<RunStatus> {
        Self::ALL
            .iter()
            .copied()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }

    /// Validate a transition, returning a typed error when it is not allowed.
    pub fn check_transition(&self, to: RunStatus) -> Result<(), CoreError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Durable breadcrumb recording the last-begun stage of a run's execution.
///
/// Declaration order is execution order; a step is written before the
/// blocking operation it names.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStep {
    NodeSelection,
    NodeProvisioning,
    NodeAgentReady,
    WorkspaceCreation,
    WorkspaceReady,
    AgentSession,
    Running,
}

string_enum!(ExecutionStep, "execution step", {
    NodeSelection => "node_selection",
    NodeProvisioning => "node_provisioning",
    NodeAgentReady => "node_agent_ready",
    WorkspaceCreation => "workspace_creation",
    WorkspaceReady => "workspace_ready",
    AgentSession => "agent_session",
    Running => "running",
});

impl ExecutionStep {
    /// Position in the canonical sequence, starting at zero.
    pub fn ordinal(&self) -> u8 {
        *self as u8
    }
}

/// Status of a node record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

string_enum!(NodeStatus, "node status", {
    Creating => "creating",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Error => "error",
});

/// Warm-pool lifecycle phase of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// At least one workspace; no reclamation timer.
    #[default]
    Active,
    /// No workspaces; reclamation timer armed.
    Warm,
    /// Timer fired; physical teardown pending.
    Destroying,
}

string_enum!(LifecyclePhase, "lifecycle phase", {
    Active => "active",
    Warm => "warm",
    Destroying => "destroying",
});

/// Status of a workspace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    #[default]
    Creating,
    Running,
    Recovery,
    Error,
    Stopped,
}

string_enum!(WorkspaceStatus, "workspace status", {
    Creating => "creating",
    Running => "running",
    Recovery => "recovery",
    Error => "error",
    Stopped => "stopped",
});

impl WorkspaceStatus {
    /// Usable for starting an agent session.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Running | Self::Recovery)
    }

    /// Will never become ready.
    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }
}

/// Status of an agent session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Created,
    Running,
    Suspended,
    Stopped,
}

string_enum!(SessionStatus, "session status", {
    Created => "created",
    Running => "running",
    Suspended => "suspended",
    Stopped => "stopped",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_transitions_follow_table() {
        assert!(RunStatus::Queued.can_transition_to(RunStatus::Delegated));
        assert!(RunStatus::Delegated.can_transition_to(RunStatus::InProgress));
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Ready));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Ready));
        assert!(!RunStatus::Queued.can_transition_to(RunStatus::InProgress));
        assert!(!RunStatus::Delegated.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_completed_is_terminal_without_exits() {
        for to in RunStatus::ALL {
            assert!(!RunStatus::Completed.can_transition_to(*to));
        }
    }

    #[test]
    fn test_sources_of_failed() {
        let sources = RunStatus::sources_of(RunStatus::Failed);
        assert_eq!(
            sources,
            vec![RunStatus::Queued, RunStatus::Delegated, RunStatus::InProgress]
        );
    }

    #[test]
    fn test_check_transition_error_names_states() {
        let err = RunStatus::Draft
            .check_transition(RunStatus::InProgress)
            .unwrap_err();
        assert_eq!(err.to_string(), "Invalid state transition: draft -> in_progress");
    }

    #[test]
    fn test_execution_step_order() {
        assert!(ExecutionStep::NodeSelection < ExecutionStep::NodeProvisioning);
        assert!(ExecutionStep::WorkspaceReady < ExecutionStep::AgentSession);
        assert_eq!(ExecutionStep::Running.ordinal(), 6);
    }

    #[test]
    fn test_status_strings_parse_back() {
        assert_eq!(
            "workspace_ready".parse::<ExecutionStep>().unwrap(),
            ExecutionStep::WorkspaceReady
        );
        assert_eq!("in_progress".parse::<RunStatus>().unwrap(), RunStatus::InProgress);
        assert!("bogus".parse::<LifecyclePhase>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&RunStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&ExecutionStep::NodeAgentReady).unwrap();
        assert_eq!(json, "\"node_agent_ready\"");
    }
}

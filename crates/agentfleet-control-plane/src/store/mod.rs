//! Durable records and conditional writes.
//!
//! The store holds the only shared mutable state of the control plane: task
//! runs, nodes, workspaces and agent sessions. Every write to a status or
//! lifecycle-phase field is conditional on the expected prior value and
//! reports whether a row was affected. A `false` result means another actor
//! (the recovery sweep, a user cancel, a concurrent claim) got there first and
//! the caller must take no further action.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use agentfleet_core::{
    AgentSession, ExecutionStep, LifecyclePhase, Node, NodeId, NodeStatus, RunId, RunStatus,
    SessionId, SessionStatus, TaskRun, Workspace, WorkspaceId, WorkspaceStatus,
};

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] refinery::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Fields to set on a task run. `None` leaves the stored value untouched;
/// `updated_at` is always bumped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub execution_step: Option<ExecutionStep>,
    pub node_id: Option<NodeId>,
    pub workspace_id: Option<WorkspaceId>,
    pub agent_session_id: Option<SessionId>,
    pub auto_provisioned_node: Option<bool>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub output_summary: Option<String>,
    pub output_branch: Option<String>,
}

impl RunPatch {
    /// Patch that only moves the status.
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Patch that only writes a breadcrumb.
    pub fn step(step: ExecutionStep) -> Self {
        Self {
            execution_step: Some(step),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }
}

/// Fields to set on a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePatch {
    pub status: Option<NodeStatus>,
    pub phase: Option<LifecyclePhase>,
    pub address: Option<String>,
    pub instance_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// `Some(None)` clears the timestamp.
    pub warm_since: Option<Option<DateTime<Utc>>>,
}

/// Precondition for a node update.
#[derive(Debug, Clone, Copy)]
pub struct NodeCondition<'a> {
    /// The stored phase must be one of these; empty accepts any phase.
    pub phases: &'a [LifecyclePhase],
    /// The node must host no workspaces.
    pub idle_only: bool,
}

impl<'a> NodeCondition<'a> {
    pub fn any() -> Self {
        Self {
            phases: &[],
            idle_only: false,
        }
    }

    pub fn phase(phases: &'a [LifecyclePhase]) -> Self {
        Self {
            phases,
            idle_only: false,
        }
    }

    pub fn idle(mut self) -> Self {
        self.idle_only = true;
        self
    }

    fn accepts(&self, node: &Node) -> bool {
        (self.phases.is_empty() || self.phases.contains(&node.phase))
            && (!self.idle_only || node.active_workspaces == 0)
    }
}

/// Fields to set on a workspace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkspacePatch {
    pub status: Option<WorkspaceStatus>,
    pub ready_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub callback_token_hash: Option<String>,
    pub callback_token_expires_at: Option<DateTime<Utc>>,
}

impl WorkspacePatch {
    pub fn status(status: WorkspaceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Fields to set on an agent session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Durable store for control-plane records.
#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_run(&self, run: &TaskRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: &RunId) -> Result<Option<TaskRun>, StoreError>;

    /// Runs whose status is one of `statuses`; empty returns every run.
    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<TaskRun>, StoreError>;

    /// Apply `patch` iff the stored status is in `expected` and the patch's
    /// execution step (if any) does not precede the stored one.
    async fn update_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError>;

    /// [`Store::update_run`], additionally conditional on the run still being
    /// on execution `attempt`.
    async fn update_run_attempt(
        &self,
        id: &RunId,
        attempt: u32,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError>;

    /// `failed|cancelled -> ready`, clearing every trace of the previous
    /// execution and incrementing `attempt`.
    async fn reset_run_for_retry(&self, id: &RunId) -> Result<bool, StoreError>;

    async fn insert_node(&self, node: &Node) -> Result<(), StoreError>;

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, StoreError>;

    async fn list_nodes(&self, phase: Option<LifecyclePhase>) -> Result<Vec<Node>, StoreError>;

    async fn update_node(
        &self,
        id: &NodeId,
        condition: NodeCondition<'_>,
        patch: NodePatch,
    ) -> Result<bool, StoreError>;

    /// Take one workspace slot iff the node is `running`, `active` and below
    /// capacity.
    async fn reserve_node_slot(&self, id: &NodeId) -> Result<bool, StoreError>;

    /// Give a slot back; returns the remaining workspace count, or `None` if
    /// the node no longer exists.
    async fn release_node_slot(&self, id: &NodeId) -> Result<Option<u32>, StoreError>;

    async fn delete_node(&self, id: &NodeId) -> Result<bool, StoreError>;

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), StoreError>;

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError>;

    async fn list_workspaces(
        &self,
        status: Option<WorkspaceStatus>,
    ) -> Result<Vec<Workspace>, StoreError>;

    async fn update_workspace(
        &self,
        id: &WorkspaceId,
        expected: &[WorkspaceStatus],
        patch: WorkspacePatch,
    ) -> Result<bool, StoreError>;

    async fn insert_session(&self, session: &AgentSession) -> Result<(), StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<AgentSession>, StoreError>;

    async fn update_session(
        &self,
        id: &SessionId,
        expected: &[SessionStatus],
        patch: SessionPatch,
    ) -> Result<bool, StoreError>;
}

/// Whether a breadcrumb write of `next` over `current` keeps the step monotonic.
pub(crate) fn step_advances(current: Option<ExecutionStep>, next: Option<ExecutionStep>) -> bool {
    match (current, next) {
        (Some(current), Some(next)) => next >= current,
        _ => true,
    }
}

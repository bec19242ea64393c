//! In-process store.
//!
//! Each table is a `RwLock<HashMap>`; holding the write guard across the
//! check and the mutation makes every conditional update atomic. Nothing
//! survives a restart, so this backend is for tests and single-shot demos.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use agentfleet_core::{
    AgentSession, LifecyclePhase, Node, NodeId, NodeStatus, RunId, RunStatus, SessionId,
    SessionStatus, TaskRun, Workspace, WorkspaceId, WorkspaceStatus,
};

use super::{
    step_advances, NodeCondition, NodePatch, RunPatch, SessionPatch, Store, StoreError,
    WorkspacePatch,
};

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    runs: RwLock<HashMap<RunId, TaskRun>>,
    nodes: RwLock<HashMap<NodeId, Node>>,
    workspaces: RwLock<HashMap<WorkspaceId, Workspace>>,
    sessions: RwLock<HashMap<SessionId, AgentSession>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cas_run(
        &self,
        id: &RunId,
        attempt: Option<u32>,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let Some(run) = runs.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&run.status)
            || attempt.is_some_and(|attempt| attempt != run.attempt)
            || !step_advances(run.execution_step, patch.execution_step)
        {
            return Ok(false);
        }
        apply_run_patch(run, patch);
        Ok(true)
    }
}

fn apply_run_patch(run: &mut TaskRun, patch: RunPatch) {
    if let Some(status) = patch.status {
        run.status = status;
    }
    if let Some(step) = patch.execution_step {
        run.execution_step = Some(step);
    }
    if let Some(node_id) = patch.node_id {
        run.node_id = Some(node_id);
    }
    if let Some(workspace_id) = patch.workspace_id {
        run.workspace_id = Some(workspace_id);
    }
    if let Some(session_id) = patch.agent_session_id {
        run.agent_session_id = Some(session_id);
    }
    if let Some(flag) = patch.auto_provisioned_node {
        run.auto_provisioned_node = flag;
    }
    if let Some(at) = patch.started_at {
        run.started_at = Some(at);
    }
    if let Some(at) = patch.completed_at {
        run.completed_at = Some(at);
    }
    if let Some(message) = patch.error_message {
        run.error_message = Some(message);
    }
    if let Some(summary) = patch.output_summary {
        run.output_summary = Some(summary);
    }
    if let Some(branch) = patch.output_branch {
        run.output_branch = Some(branch);
    }
    run.updated_at = Utc::now();
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_run(&self, run: &TaskRun) -> Result<(), StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(StoreError::Duplicate(run.id.to_string()));
        }
        runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> Result<Option<TaskRun>, StoreError> {
        Ok(self.runs.read().await.get(id).cloned())
    }

    async fn list_runs(&self, statuses: &[RunStatus]) -> Result<Vec<TaskRun>, StoreError> {
        let runs = self.runs.read().await;
        let mut selected: Vec<TaskRun> = runs
            .values()
            .filter(|r| statuses.is_empty() || statuses.contains(&r.status))
            .cloned()
            .collect();
        selected.sort_by_key(|r| r.created_at);
        Ok(selected)
    }

    async fn update_run(
        &self,
        id: &RunId,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        self.cas_run(id, None, expected, patch).await
    }

    async fn update_run_attempt(
        &self,
        id: &RunId,
        attempt: u32,
        expected: &[RunStatus],
        patch: RunPatch,
    ) -> Result<bool, StoreError> {
        self.cas_run(id, Some(attempt), expected, patch).await
    }

    async fn reset_run_for_retry(&self, id: &RunId) -> Result<bool, StoreError> {
        let mut runs = self.runs.write().await;
        let Some(run) = runs.get_mut(id) else {
            return Ok(false);
        };
        if !matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Ok(false);
        }
        run.status = RunStatus::Ready;
        run.execution_step = None;
        run.node_id = None;
        run.workspace_id = None;
        run.agent_session_id = None;
        run.auto_provisioned_node = false;
        run.started_at = None;
        run.completed_at = None;
        run.error_message = None;
        run.output_summary = None;
        run.output_branch = None;
        run.attempt += 1;
        run.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_node(&self, node: &Node) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.id) {
            return Err(StoreError::Duplicate(node.id.to_string()));
        }
        nodes.insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &NodeId) -> Result<Option<Node>, StoreError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn list_nodes(&self, phase: Option<LifecyclePhase>) -> Result<Vec<Node>, StoreError> {
        let nodes = self.nodes.read().await;
        let mut selected: Vec<Node> = nodes
            .values()
            .filter(|n| phase.map_or(true, |p| n.phase == p))
            .cloned()
            .collect();
        selected.sort_by_key(|n| n.created_at);
        Ok(selected)
    }

    async fn update_node(
        &self,
        id: &NodeId,
        condition: NodeCondition<'_>,
        patch: NodePatch,
    ) -> Result<bool, StoreError> {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            return Ok(false);
        };
        if !condition.accepts(node) {
            return Ok(false);
        }
        if let Some(status) = patch.status {
            node.status = status;
        }
        if let Some(phase) = patch.phase {
            node.phase = phase;
        }
        if let Some(address) = patch.address {
            node.address = Some(address);
        }
        if let Some(instance_id) = patch.instance_id {
            node.instance_id = Some(instance_id);
        }
        if let Some(at) = patch.last_heartbeat {
            node.last_heartbeat = Some(at);
        }
        if let Some(warm_since) = patch.warm_since {
            node.warm_since = warm_since;
        }
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn reserve_node_slot(&self, id: &NodeId) -> Result<bool, StoreError> {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            return Ok(false);
        };
        if node.status != NodeStatus::Running
            || node.phase != LifecyclePhase::Active
            || node.active_workspaces >= node.max_workspaces
        {
            return Ok(false);
        }
        node.active_workspaces += 1;
        node.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_node_slot(&self, id: &NodeId) -> Result<Option<u32>, StoreError> {
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get_mut(id) else {
            return Ok(None);
        };
        node.active_workspaces = node.active_workspaces.saturating_sub(1);
        node.updated_at = Utc::now();
        Ok(Some(node.active_workspaces))
    }

    async fn delete_node(&self, id: &NodeId) -> Result<bool, StoreError> {
        Ok(self.nodes.write().await.remove(id).is_some())
    }

    async fn insert_workspace(&self, workspace: &Workspace) -> Result<(), StoreError> {
        let mut workspaces = self.workspaces.write().await;
        if workspaces.contains_key(&workspace.id) {
            return Err(StoreError::Duplicate(workspace.id.to_string()));
        }
        workspaces.insert(workspace.id.clone(), workspace.clone());
        Ok(())
    }

    async fn get_workspace(&self, id: &WorkspaceId) -> Result<Option<Workspace>, StoreError> {
        Ok(self.workspaces.read().await.get(id).cloned())
    }

    async fn list_workspaces(
        &self,
        status: Option<WorkspaceStatus>,
    ) -> Result<Vec<Workspace>, StoreError> {
        let workspaces = self.workspaces.read().await;
        let mut selected: Vec<Workspace> = workspaces
            .values()
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect();
        selected.sort_by_key(|w| w.created_at);
        Ok(selected)
    }

    async fn update_workspace(
        &self,
        id: &WorkspaceId,
        expected: &[WorkspaceStatus],
        patch: WorkspacePatch,
    ) -> Result<bool, StoreError> {
        let mut workspaces = self.workspaces.write().await;
        let Some(workspace) = workspaces.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&workspace.status) {
            return Ok(false);
        }
        if let Some(status) = patch.status {
            workspace.status = status;
        }
        if let Some(at) = patch.ready_at {
            workspace.ready_at = Some(at);
        }
        if let Some(message) = patch.error_message {
            workspace.error_message = Some(message);
        }
        if let Some(hash) = patch.callback_token_hash {
            workspace.callback_token_hash = Some(hash);
        }
        if let Some(at) = patch.callback_token_expires_at {
            workspace.callback_token_expires_at = Some(at);
        }
        workspace.updated_at = Utc::now();
        Ok(true)
    }

    async fn insert_session(&self, session: &AgentSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(StoreError::Duplicate(session.id.to_string()));
        }
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<AgentSession>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn update_session(
        &self,
        id: &SessionId,
        expected: &[SessionStatus],
        patch: SessionPatch,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(id) else {
            return Ok(false);
        };
        if !expected.contains(&session.status) {
            return Ok(false);
        }
        if let Some(status) = patch.status {
            session.status = status;
        }
        if let Some(at) = patch.started_at {
            session.started_at = Some(at);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::store::tests as shared;

    #[tokio::test]
    async fn test_run_cas() {
        shared::exercise_run_cas(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_node_slots() {
        shared::exercise_node_slots(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_workspaces_and_sessions() {
        shared::exercise_workspaces_and_sessions(Arc::new(MemoryStore::new())).await;
    }

    #[tokio::test]
    async fn test_concurrent_transitions_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let mut run = TaskRun::new(agentfleet_core::NewRun::new("x", "repo"));
        run.status = RunStatus::Delegated;
        store.insert_run(&run).await.unwrap();

        let mut handles = Vec::new();
        for target in [RunStatus::InProgress, RunStatus::Failed] {
            let store = store.clone();
            let id = run.id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update_run(&id, &[RunStatus::Delegated], RunPatch::status(target))
                    .await
                    .unwrap()
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}

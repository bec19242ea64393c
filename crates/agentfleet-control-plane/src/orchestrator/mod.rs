//! Task execution orchestrator.
//!
//! Owns the run state machine. Submission, start, cancel and retry are
//! synchronous requests; the execution itself ([`execution`]) runs as a
//! detached job that may die between any two steps. Everything it needs to be
//! recovered from is written to the run record before it blocks.

mod error;
mod execution;
mod readiness;

use std::sync::Arc;

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use agentfleet_core::protocol::StatusCallbackRequest;
use agentfleet_core::{
    CoreError, ExecutionStep, NewRun, NodeId, RunId, RunStatus, SessionStatus, TaskRun,
    Workspace, WorkspaceId, WorkspaceStatus,
};

use crate::agent_client::AgentEndpoint;
use crate::config::Config;
use crate::crypto::verify_token;
use crate::node_lifecycle::NodeLifecycleManager;
use crate::store::{RunPatch, SessionPatch, Store, WorkspacePatch};

pub use error::{ExecutionError, OrchestratorError};
use readiness::ReadinessWaiters;

pub struct Orchestrator {
    store: Arc<dyn Store>,
    nodes: Arc<NodeLifecycleManager>,
    agents: Arc<dyn AgentEndpoint>,
    config: Arc<Config>,
    waiters: ReadinessWaiters,
    jobs: TaskTracker,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        nodes: Arc<NodeLifecycleManager>,
        agents: Arc<dyn AgentEndpoint>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            nodes,
            agents,
            config,
            waiters: ReadinessWaiters::default(),
            jobs: TaskTracker::new(),
        }
    }

    /// Create a run. Non-draft runs are started immediately; a run whose
    /// dependencies are not yet completed is left in `ready`.
    pub async fn submit(self: &Arc<Self>, request: NewRun) -> Result<TaskRun, OrchestratorError> {
        request.validate()?;
        let run = TaskRun::new(request);
        self.store.insert_run(&run).await?;
        info!(run_id = %run.id, status = %run.status, repository = %run.repository, "Task run submitted");

        if run.status != RunStatus::Ready {
            return Ok(run);
        }
        match self.start(&run.id).await {
            Ok(run) => Ok(run),
            Err(OrchestratorError::DependenciesIncomplete(pending)) => {
                info!(run_id = %run.id, pending = pending.len(), "Run waiting on dependencies");
                Ok(run)
            }
            Err(e) => Err(e),
        }
    }

    /// `draft|ready -> queued`, then launch the detached execution.
    pub async fn start(self: &Arc<Self>, run_id: &RunId) -> Result<TaskRun, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        match run.status {
            RunStatus::Draft => {
                if !self
                    .store
                    .update_run(run_id, &[RunStatus::Draft], RunPatch::status(RunStatus::Ready))
                    .await?
                {
                    return Err(OrchestratorError::Conflict(format!(
                        "run {} changed while starting",
                        run_id
                    )));
                }
            }
            RunStatus::Ready => {}
            other => other.check_transition(RunStatus::Queued)?,
        }

        let pending = self.pending_dependencies(&run).await?;
        if !pending.is_empty() {
            return Err(OrchestratorError::DependenciesIncomplete(pending));
        }

        let patch = RunPatch {
            status: Some(RunStatus::Queued),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        if !self
            .store
            .update_run(run_id, &[RunStatus::Ready], patch)
            .await?
        {
            return Err(OrchestratorError::Conflict(format!(
                "run {} changed while starting",
                run_id
            )));
        }
        info!(run_id = %run_id, attempt = run.attempt, "Run queued");

        self.spawn_execution(run_id.clone());
        self.load_run(run_id).await
    }

    pub async fn get_status(&self, run_id: &RunId) -> Result<TaskRun, OrchestratorError> {
        self.load_run(run_id).await
    }

    pub async fn list_runs(&self) -> Result<Vec<TaskRun>, OrchestratorError> {
        Ok(self.store.list_runs(&[]).await?)
    }

    /// Cancel a non-terminal run. An in-flight execution is not interrupted;
    /// its next conditional write fails and it stops there.
    pub async fn cancel(&self, run_id: &RunId) -> Result<TaskRun, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        run.status.check_transition(RunStatus::Cancelled)?;

        let patch = RunPatch::status(RunStatus::Cancelled).with_completed_at(Utc::now());
        let sources = RunStatus::sources_of(RunStatus::Cancelled);
        if !self.store.update_run(run_id, &sources, patch).await? {
            return Err(OrchestratorError::Conflict(format!(
                "run {} changed while cancelling",
                run_id
            )));
        }
        info!(run_id = %run_id, from = %run.status, "Run cancelled");

        self.cleanup(run_id).await;
        self.load_run(run_id).await
    }

    /// Start a fresh execution of a failed or cancelled run.
    pub async fn retry(self: &Arc<Self>, run_id: &RunId) -> Result<TaskRun, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        if !matches!(run.status, RunStatus::Failed | RunStatus::Cancelled) {
            return Err(CoreError::InvalidStateTransition {
                from: run.status.to_string(),
                to: RunStatus::Ready.to_string(),
            }
            .into());
        }
        if !self.store.reset_run_for_retry(run_id).await? {
            return Err(OrchestratorError::Conflict(format!(
                "run {} changed while resetting",
                run_id
            )));
        }
        info!(run_id = %run_id, previous = %run.status, "Run reset for retry");
        self.start(run_id).await
    }

    /// Readiness callback from the agent.
    pub async fn handle_workspace_ready(
        &self,
        workspace_id: &WorkspaceId,
        token: &str,
    ) -> Result<Workspace, OrchestratorError> {
        let workspace = self.load_workspace(workspace_id).await?;
        self.authorize(&workspace, token)?;

        let patch = WorkspacePatch {
            status: Some(WorkspaceStatus::Running),
            ready_at: Some(Utc::now()),
            ..Default::default()
        };
        let updated = self
            .store
            .update_workspace(workspace_id, &[WorkspaceStatus::Creating], patch)
            .await?;
        if !updated && !workspace.status.is_ready() {
            return Err(OrchestratorError::Conflict(format!(
                "workspace {} is {}",
                workspace_id, workspace.status
            )));
        }
        if updated {
            info!(workspace_id = %workspace_id, run_id = %workspace.run_id, "Workspace ready");
        }

        self.waiters.notify(workspace_id).await;
        self.load_workspace(workspace_id).await
    }

    /// Provisioning-failure callback from the agent.
    pub async fn handle_workspace_failed(
        &self,
        workspace_id: &WorkspaceId,
        token: &str,
        reason: &str,
    ) -> Result<Workspace, OrchestratorError> {
        let workspace = self.load_workspace(workspace_id).await?;
        self.authorize(&workspace, token)?;

        let reason = if reason.trim().is_empty() {
            "workspace provisioning failed"
        } else {
            reason
        };
        let patch = WorkspacePatch {
            status: Some(WorkspaceStatus::Error),
            error_message: Some(reason.to_string()),
            ..Default::default()
        };
        let updated = self
            .store
            .update_workspace(workspace_id, &[WorkspaceStatus::Creating], patch)
            .await?;
        if !updated && workspace.status != WorkspaceStatus::Error {
            return Err(OrchestratorError::Conflict(format!(
                "workspace {} is {}",
                workspace_id, workspace.status
            )));
        }
        if updated {
            warn!(workspace_id = %workspace_id, run_id = %workspace.run_id, reason = %reason, "Workspace provisioning failed");
        }

        self.waiters.notify(workspace_id).await;
        self.load_workspace(workspace_id).await
    }

    /// Terminal status reported by the agent session.
    pub async fn handle_status_callback(
        &self,
        run_id: &RunId,
        token: &str,
        request: StatusCallbackRequest,
    ) -> Result<TaskRun, OrchestratorError> {
        let to = request.to_status;
        if !to.is_terminal() {
            return Err(CoreError::InvalidInput(format!(
                "callback status must be terminal, got {}",
                to
            ))
            .into());
        }

        let run = self.load_run(run_id).await?;
        let workspace_id = run
            .workspace_id
            .clone()
            .ok_or(OrchestratorError::Unauthorized)?;
        let workspace = self.load_workspace(&workspace_id).await?;
        self.authorize(&workspace, token)?;
        if workspace.run_id != run.id {
            return Err(OrchestratorError::Unauthorized);
        }

        if run.status == to {
            debug!(run_id = %run_id, status = %to, "Duplicate status callback");
            return Ok(run);
        }

        // The agent can finish before the execution's own delegated ->
        // in_progress write; take that edge first so the table is respected.
        if run.status == RunStatus::Delegated && to != RunStatus::Cancelled {
            let patch = RunPatch {
                status: Some(RunStatus::InProgress),
                execution_step: Some(ExecutionStep::Running),
                ..Default::default()
            };
            self.store
                .update_run(run_id, &[RunStatus::Delegated], patch)
                .await?;
        }

        let mut patch = RunPatch::status(to).with_completed_at(Utc::now());
        patch.output_summary = request.output_summary.clone();
        patch.output_branch = request.output_branch.clone();
        if to == RunStatus::Failed {
            let detail = request
                .output_summary
                .as_deref()
                .unwrap_or("agent reported failure");
            patch.error_message = Some(format!(
                "AgentFailed: {} (execution step: {})",
                detail,
                ExecutionStep::Running
            ));
        }
        let expected: Vec<RunStatus> = [RunStatus::Delegated, RunStatus::InProgress]
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect();

        if !self.store.update_run(run_id, &expected, patch).await? {
            let current = self.load_run(run_id).await?;
            if current.status == to {
                return Ok(current);
            }
            warn!(run_id = %run_id, status = %current.status, requested = %to, "Rejected status callback");
            return Err(OrchestratorError::Conflict(format!(
                "run {} is {}",
                run_id, current.status
            )));
        }
        info!(run_id = %run_id, status = %to, "Run finished");

        self.cleanup(run_id).await;
        self.load_run(run_id).await
    }

    /// Release everything a terminal run holds. Best effort: failures are
    /// logged and never propagate.
    pub async fn cleanup(&self, run_id: &RunId) {
        let run = match self.store.get_run(run_id).await {
            Ok(Some(run)) => run,
            Ok(None) => return,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Cleanup could not load run");
                return;
            }
        };

        if let Some(workspace_id) = &run.workspace_id {
            self.stop_workspace(workspace_id).await;
            self.waiters.remove(workspace_id).await;
        }

        if let Some(session_id) = &run.agent_session_id {
            let patch = SessionPatch {
                status: Some(SessionStatus::Stopped),
                ..Default::default()
            };
            let live = [
                SessionStatus::Created,
                SessionStatus::Running,
                SessionStatus::Suspended,
            ];
            if let Err(e) = self.store.update_session(session_id, &live, patch).await {
                warn!(run_id = %run_id, session_id = %session_id, error = %e, "Failed to stop session record");
            }
        }

        if let Some(node_id) = &run.node_id {
            match self.store.release_node_slot(node_id).await {
                Ok(Some(0)) => self.return_to_pool(node_id).await,
                Ok(Some(remaining)) => {
                    debug!(node_id = %node_id, remaining, "Node still hosts workspaces")
                }
                Ok(None) => debug!(node_id = %node_id, "Node already gone"),
                Err(e) => {
                    warn!(run_id = %run_id, node_id = %node_id, error = %e, "Failed to release node slot")
                }
            }
        }
    }

    /// Wait for every detached execution spawned so far.
    pub async fn drain(&self) {
        self.jobs.close();
        self.jobs.wait().await;
        self.jobs.reopen();
    }

    async fn stop_workspace(&self, workspace_id: &WorkspaceId) {
        let workspace = match self.store.get_workspace(workspace_id).await {
            Ok(Some(workspace)) => workspace,
            Ok(None) => return,
            Err(e) => {
                warn!(workspace_id = %workspace_id, error = %e, "Cleanup could not load workspace");
                return;
            }
        };

        let address = match self.store.get_node(&workspace.node_id).await {
            Ok(node) => node.and_then(|n| n.address),
            Err(e) => {
                warn!(node_id = %workspace.node_id, error = %e, "Cleanup could not load node");
                None
            }
        };
        if let Some(address) = address {
            if let Err(e) = self.agents.stop_workspace(&address, workspace_id).await {
                warn!(workspace_id = %workspace_id, error = %e, "Agent failed to stop workspace");
            }
        }

        let live = [
            WorkspaceStatus::Creating,
            WorkspaceStatus::Running,
            WorkspaceStatus::Recovery,
        ];
        match self
            .store
            .update_workspace(workspace_id, &live, WorkspacePatch::status(WorkspaceStatus::Stopped))
            .await
        {
            Ok(true) => debug!(workspace_id = %workspace_id, "Workspace stopped"),
            Ok(false) => {}
            Err(e) => warn!(workspace_id = %workspace_id, error = %e, "Failed to mark workspace stopped"),
        }
    }

    /// Put an empty auto-provisioned node back in the warm pool.
    async fn return_to_pool(&self, node_id: &NodeId) {
        let node = match self.store.get_node(node_id).await {
            Ok(Some(node)) => node,
            Ok(None) => return,
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "Could not load node");
                return;
            }
        };
        if !node.auto_provisioned {
            return;
        }
        if let Err(e) = self.nodes.mark_idle(node_id).await {
            warn!(node_id = %node_id, error = %e, "Failed to return node to warm pool");
        }
    }

    async fn pending_dependencies(&self, run: &TaskRun) -> Result<Vec<RunId>, OrchestratorError> {
        let mut pending = Vec::new();
        for dependency in &run.depends_on {
            let completed = self
                .store
                .get_run(dependency)
                .await?
                .is_some_and(|d| d.status == RunStatus::Completed);
            if !completed {
                pending.push(dependency.clone());
            }
        }
        Ok(pending)
    }

    fn authorize(&self, workspace: &Workspace, token: &str) -> Result<(), OrchestratorError> {
        if verify_token(
            token,
            workspace.callback_token_hash.as_deref(),
            workspace.callback_token_expires_at,
            Utc::now(),
        ) {
            Ok(())
        } else {
            warn!(workspace_id = %workspace.id, "Rejected callback with invalid token");
            Err(OrchestratorError::Unauthorized)
        }
    }

    async fn load_run(&self, run_id: &RunId) -> Result<TaskRun, OrchestratorError> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound(run_id.clone()))
    }

    async fn load_workspace(&self, id: &WorkspaceId) -> Result<Workspace, OrchestratorError> {
        self.store
            .get_workspace(id)
            .await?
            .ok_or_else(|| OrchestratorError::WorkspaceNotFound(id.clone()))
    }
}

//! The detached execution job.
//!
//! Steps, each preceded by a durable breadcrumb:
//!
//! 1. `node_selection`: preferred node, else claim a warm node, else scan
//!    active nodes for a free slot.
//! 2. `node_provisioning` / `node_agent_ready`: provision a node and wait for
//!    its agent when nothing could be selected.
//! 3. `workspace_creation`: request a workspace from the node's agent.
//! 4. `queued -> delegated`, only after the workspace request succeeded.
//! 5. `workspace_ready`: wait for the readiness callback (or poll).
//! 6. `agent_session`: register the session, then start it with the
//!    instruction. The step is done only once the start call succeeds.
//! 7. `delegated -> in_progress`.
//!
//! Every write is conditional on the expected status. A write that affects
//! nothing means the run was cancelled, force-failed by the recovery sweep,
//! or finished by a callback; the job then stops without touching anything.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use agentfleet_core::protocol::{CreateSessionRequest, CreateWorkspaceRequest, StartSessionRequest};
use agentfleet_core::{
    AgentSession, ExecutionStep, LifecyclePhase, Node, NodeId, NodeSpec, NodeStatus, RunId,
    RunStatus, SessionStatus, TaskRun, Workspace, WorkspaceId, WorkspaceStatus,
};

use super::{ExecutionError, Orchestrator};
use crate::crypto::CallbackToken;
use crate::store::{RunPatch, SessionPatch, WorkspacePatch};

/// Ownership marker for one execution attempt.
struct Execution {
    run: TaskRun,
    step: Option<ExecutionStep>,
}

impl Orchestrator {
    pub(super) fn spawn_execution(self: &Arc<Self>, run_id: RunId) {
        let this = Arc::clone(self);
        self.jobs.spawn(async move { this.execute(run_id).await });
    }

    /// Drive a queued run to `in_progress`. Failures are written to the run;
    /// nothing is returned.
    pub async fn execute(&self, run_id: RunId) {
        let run = match self.store.get_run(&run_id).await {
            Ok(Some(run)) if run.status == RunStatus::Queued => run,
            Ok(_) => {
                info!(run_id = %run_id, "Run no longer queued; nothing to execute");
                return;
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Could not load run to execute it");
                return;
            }
        };
        let attempt = run.attempt;
        let mut exec = Execution {
            step: run.execution_step,
            run,
        };
        match self.drive(&mut exec).await {
            Ok(()) => {}
            Err(ExecutionError::Superseded) => {
                info!(run_id = %run_id, attempt, "Run changed underneath execution; stopping")
            }
            Err(e) => {
                self.fail_run(&run_id, attempt, &e).await;
            }
        }
    }

    /// Force execution `attempt` of a run to `failed` with `err` and release
    /// what it holds. Returns whether this call won the transition; a run
    /// that has since been retried is left alone.
    pub async fn fail_run(&self, run_id: &RunId, attempt: u32, err: &ExecutionError) -> bool {
        let run = match self.store.get_run(run_id).await {
            Ok(Some(run)) if run.attempt == attempt => run,
            Ok(_) => return false,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Could not load run to fail it");
                return false;
            }
        };
        let message = err.persisted_message(run.execution_step);
        let patch = RunPatch::status(RunStatus::Failed)
            .with_error(message.clone())
            .with_completed_at(Utc::now());
        let executing = [RunStatus::Queued, RunStatus::Delegated, RunStatus::InProgress];

        match self
            .store
            .update_run_attempt(run_id, attempt, &executing, patch)
            .await
        {
            Ok(true) => {
                error!(run_id = %run_id, step = %run.step_label(), error = %message, "Run failed");
                self.cleanup(run_id).await;
                true
            }
            Ok(false) => {
                warn!(run_id = %run_id, error = %message, "Run already left execution; failure not recorded");
                false
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "Could not record run failure");
                false
            }
        }
    }

    async fn drive(&self, exec: &mut Execution) -> Result<(), ExecutionError> {
        let run_id = &exec.run.id.clone();

        // 1
        self.breadcrumb(exec, RunStatus::Queued, ExecutionStep::NodeSelection)
            .await?;
        let (node, provisioned) = match self.select_node(&exec.run).await? {
            Some(node) => (node, false),
            // 2
            None => (self.provision_node(exec).await?, true),
        };
        let assigned = RunPatch {
            node_id: Some(node.id.clone()),
            auto_provisioned_node: Some(provisioned),
            ..Default::default()
        };
        if let Err(e) = self.record(exec, RunStatus::Queued, assigned).await {
            self.release_unassigned(&node).await;
            return Err(e);
        }
        info!(run_id = %run_id, node_id = %node.id, provisioned, "Node assigned");
        let address = node.address.clone().ok_or_else(|| {
            ExecutionError::WorkspaceCreationFailed(format!("node {} has no address", node.id))
        })?;

        // 3
        self.breadcrumb(exec, RunStatus::Queued, ExecutionStep::WorkspaceCreation)
            .await?;
        let token = CallbackToken::issue(self.config.callback_token_ttl);
        let mut workspace = Workspace::new(
            node.id.clone(),
            run_id.clone(),
            exec.run.repository.clone(),
            exec.run.branch.clone(),
        );
        workspace.callback_token_hash = Some(token.token_hash.clone());
        workspace.callback_token_expires_at = Some(token.expires_at);
        self.store.insert_workspace(&workspace).await?;
        self.record(
            exec,
            RunStatus::Queued,
            RunPatch {
                workspace_id: Some(workspace.id.clone()),
                ..Default::default()
            },
        )
        .await?;

        let waiter = self.waiters.register(&workspace.id).await;
        let request = CreateWorkspaceRequest {
            workspace_id: workspace.id.clone(),
            repository: workspace.repository.clone(),
            branch: workspace.branch.clone(),
            callback_url: self.config.workspace_callback_base(),
            callback_token: token.plaintext.clone(),
        };
        if let Err(e) = self.agents.create_workspace(&address, &request).await {
            let reason = format!("create-workspace request failed: {}", e);
            let patch = WorkspacePatch {
                status: Some(WorkspaceStatus::Error),
                error_message: Some(reason.clone()),
                ..Default::default()
            };
            self.store
                .update_workspace(&workspace.id, &[WorkspaceStatus::Creating], patch)
                .await?;
            return Err(ExecutionError::WorkspaceCreationFailed(reason));
        }

        // 4
        self.record(exec, RunStatus::Queued, RunPatch::status(RunStatus::Delegated))
            .await?;
        info!(run_id = %run_id, workspace_id = %workspace.id, "Run delegated");

        // 5
        self.breadcrumb(exec, RunStatus::Delegated, ExecutionStep::WorkspaceReady)
            .await?;
        let result = self.wait_for_workspace(exec, &workspace.id, waiter).await;
        self.waiters.remove(&workspace.id).await;
        let workspace = result?;

        // 6
        self.breadcrumb(exec, RunStatus::Delegated, ExecutionStep::AgentSession)
            .await?;
        let session = AgentSession::new(
            workspace.id.clone(),
            format!("run {}", run_id),
            exec.run.instruction.clone(),
        );
        self.store.insert_session(&session).await?;
        self.record(
            exec,
            RunStatus::Delegated,
            RunPatch {
                agent_session_id: Some(session.id.clone()),
                ..Default::default()
            },
        )
        .await?;

        let create = CreateSessionRequest {
            session_id: session.id.clone(),
            label: session.label.clone(),
        };
        self.agents
            .create_agent_session(&address, &workspace.id, &create)
            .await
            .map_err(|e| {
                ExecutionError::AgentSessionStartFailed(format!(
                    "create-session request failed: {}",
                    e
                ))
            })?;

        let start = StartSessionRequest {
            instruction: exec.run.instruction.clone(),
            run_id: run_id.clone(),
            callback_url: self.config.status_callback_url(run_id),
            callback_token: token.plaintext,
        };
        let started = self
            .agents
            .start_agent_session(&address, &workspace.id, &session.id, &start)
            .await
            .map_err(|e| {
                ExecutionError::AgentSessionStartFailed(format!(
                    "start-session request failed: {}",
                    e
                ))
            })?;
        self.store
            .update_session(
                &session.id,
                &[SessionStatus::Created],
                SessionPatch {
                    status: Some(SessionStatus::Running),
                    started_at: Some(Utc::now()),
                },
            )
            .await?;
        info!(
            run_id = %run_id,
            session_id = %session.id,
            already_started = started.already_started,
            "Agent session started"
        );

        // 7
        let patch = RunPatch {
            status: Some(RunStatus::InProgress),
            execution_step: Some(ExecutionStep::Running),
            ..Default::default()
        };
        self.record(exec, RunStatus::Delegated, patch).await?;
        info!(run_id = %run_id, "Run in progress");
        Ok(())
    }

    /// Write `step` before the blocking operation it names.
    async fn breadcrumb(
        &self,
        exec: &mut Execution,
        expected: RunStatus,
        step: ExecutionStep,
    ) -> Result<(), ExecutionError> {
        self.record(exec, expected, RunPatch::step(step)).await?;
        debug!(run_id = %exec.run.id, step = %step, previous = ?exec.step, "Execution step");
        exec.step = Some(step);
        Ok(())
    }

    /// Conditional write on behalf of this execution attempt.
    async fn record(
        &self,
        exec: &Execution,
        expected: RunStatus,
        patch: RunPatch,
    ) -> Result<(), ExecutionError> {
        // A retry resets the run to `ready` and starts a new attempt; a job
        // from the old attempt must not drive the new one.
        if self
            .store
            .update_run_attempt(&exec.run.id, exec.run.attempt, &[expected], patch)
            .await?
        {
            Ok(())
        } else {
            Err(ExecutionError::Superseded)
        }
    }

    /// Pick an existing node and reserve a workspace slot on it.
    async fn select_node(&self, run: &TaskRun) -> Result<Option<Node>, ExecutionError> {
        if let Some(preferred) = &run.preferred_node_id {
            let node = self
                .store
                .get_node(preferred)
                .await?
                .filter(|n| {
                    n.status == NodeStatus::Running && n.phase != LifecyclePhase::Destroying
                })
                .ok_or_else(|| ExecutionError::PreferredNodeUnavailable(preferred.clone()))?;
            let woken = node.phase == LifecyclePhase::Warm;
            if woken && !self.nodes.mark_active(&node.id).await? {
                return Err(ExecutionError::PreferredNodeUnavailable(node.id));
            }
            if !self.store.reserve_node_slot(&node.id).await? {
                if woken {
                    self.park_unused(&node.id).await;
                }
                return Err(ExecutionError::NodeCapacityExceeded(node.id));
            }
            return Ok(Some(node));
        }

        let size = run.node_size.as_deref();
        let location = run.node_location.as_deref();

        if let Some(node_id) = self.nodes.try_claim(size, location).await? {
            if self.store.reserve_node_slot(&node_id).await? {
                if let Some(node) = self.store.get_node(&node_id).await? {
                    return Ok(Some(node));
                }
            }
            warn!(run_id = %run.id, node_id = %node_id, "Claimed warm node became unusable");
            self.park_unused(&node_id).await;
        }

        for node in self.store.list_nodes(Some(LifecyclePhase::Active)).await? {
            if !node.has_capacity() || !node.matches(size, location) {
                continue;
            }
            if self.store.reserve_node_slot(&node.id).await? {
                debug!(run_id = %run.id, node_id = %node.id, "Placed on active node");
                return Ok(Some(node));
            }
        }
        Ok(None)
    }

    /// Provision a fresh node for this run and reserve its first slot.
    async fn provision_node(&self, exec: &mut Execution) -> Result<Node, ExecutionError> {
        self.breadcrumb(exec, RunStatus::Queued, ExecutionStep::NodeProvisioning)
            .await?;
        let spec = NodeSpec::new(
            exec.run
                .node_size
                .clone()
                .unwrap_or_else(|| self.config.default_node.size.clone()),
            exec.run
                .node_location
                .clone()
                .unwrap_or_else(|| self.config.default_node.location.clone()),
        );
        let registered = self.nodes.register(spec).await?;
        info!(run_id = %exec.run.id, node_id = %registered.id, size = %registered.size, location = %registered.location, "Provisioning node");

        let result = self.bring_up(exec, &registered).await;
        if result.is_err() {
            // A node abandoned by the lifecycle manager is already
            // destroying; anything else goes to the warm pool and its timer.
            if let Err(e) = self.nodes.mark_idle(&registered.id).await {
                warn!(node_id = %registered.id, error = %e, "Could not park unused node");
            }
        }
        result
    }

    async fn bring_up(
        &self,
        exec: &mut Execution,
        registered: &Node,
    ) -> Result<Node, ExecutionError> {
        let node = self.nodes.provision(registered).await?;
        self.breadcrumb(exec, RunStatus::Queued, ExecutionStep::NodeAgentReady)
            .await?;
        self.nodes.await_healthy(&node).await?;
        if !self.store.reserve_node_slot(&node.id).await? {
            return Err(ExecutionError::NodeCapacityExceeded(node.id));
        }
        self.store
            .get_node(&node.id)
            .await?
            .ok_or_else(|| {
                ExecutionError::ProvisioningFailed(format!("node {} disappeared", node.id))
            })
    }

    /// Send a node this run woke but could not use back to the warm pool, so
    /// it is never left `active` without workspaces or a timer.
    async fn park_unused(&self, node_id: &NodeId) {
        if let Err(e) = self.nodes.mark_idle(node_id).await {
            warn!(node_id = %node_id, error = %e, "Could not park unused node");
        }
    }

    /// Undo a slot reservation the run never recorded.
    async fn release_unassigned(&self, node: &Node) {
        match self.store.release_node_slot(&node.id).await {
            Ok(Some(0)) if node.auto_provisioned => self.park_unused(&node.id).await,
            Ok(_) => {}
            Err(e) => warn!(node_id = %node.id, error = %e, "Could not release node slot"),
        }
    }

    /// Wait for the workspace to become usable, preferring the readiness
    /// callback and falling back to polling with backoff.
    async fn wait_for_workspace(
        &self,
        exec: &Execution,
        workspace_id: &WorkspaceId,
        waiter: Arc<Notify>,
    ) -> Result<Workspace, ExecutionError> {
        let started = tokio::time::Instant::now();
        let bound = self.config.workspace_ready_timeout;
        let mut interval = self.config.workspace_poll_initial;

        loop {
            // Ownership first: a cancel stops the workspace, and that must
            // read as losing the run, not as a workspace failure.
            let run = self
                .store
                .get_run(&exec.run.id)
                .await?
                .ok_or(ExecutionError::Superseded)?;
            if run.status != RunStatus::Delegated || run.attempt != exec.run.attempt {
                return Err(ExecutionError::Superseded);
            }

            let workspace = self.store.get_workspace(workspace_id).await?.ok_or_else(|| {
                let reason = format!("workspace {} vanished", workspace_id);
                ExecutionError::WorkspaceCreationFailed(reason)
            })?;
            if workspace.status.is_ready() {
                info!(run_id = %exec.run.id, workspace_id = %workspace_id, waited = ?started.elapsed(), "Workspace ready");
                return Ok(workspace);
            }
            if workspace.status.is_dead() {
                return Err(ExecutionError::WorkspaceCreationFailed(
                    workspace
                        .error_message
                        .unwrap_or_else(|| format!("workspace entered {}", workspace.status)),
                ));
            }

            let elapsed = started.elapsed();
            if elapsed >= bound {
                return Err(ExecutionError::WorkspaceTimeout {
                    workspace_id: workspace_id.clone(),
                    waited: elapsed,
                });
            }

            debug!(workspace_id = %workspace_id, status = %workspace.status, next_poll = ?interval, "Waiting for workspace");
            tokio::select! {
                _ = waiter.notified() => {}
                _ = tokio::time::sleep(interval.min(bound - elapsed)) => {}
            }
            interval = (interval * 2).min(self.config.workspace_poll_max);
        }
    }
}

//! Recovery sweep.
//!
//! Periodic and stateless. Each cycle, in order:
//! 1. workspaces stuck in `creating` are marked `error`, so an execution that
//!    is still alive and polling observes the failure itself;
//! 2. runs stuck in `queued`, `delegated` or `in_progress` past their
//!    per-status timeout are force-failed with the last execution step in the
//!    message, then cleaned up;
//! 3. node reclamation layers two and three run, and `destroying` nodes are
//!    torn down.
//!
//! A failure on one record is logged and never stops the cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentfleet_core::{RunStatus, WorkspaceStatus};

use crate::config::{to_chrono, Config};
use crate::node_lifecycle::NodeLifecycleManager;
use crate::orchestrator::{ExecutionError, Orchestrator};
use crate::store::{RunPatch, Store, StoreError, WorkspacePatch};

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub workspaces_timed_out: usize,
    pub runs_recovered: usize,
    pub idle_nodes_destroyed: usize,
    pub expired_nodes_destroyed: usize,
    pub nodes_reaped: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoverySweep {
    store: Arc<dyn Store>,
    orchestrator: Arc<Orchestrator>,
    nodes: Arc<NodeLifecycleManager>,
    config: Arc<Config>,
}

impl RecoverySweep {
    pub fn new(
        store: Arc<dyn Store>,
        orchestrator: Arc<Orchestrator>,
        nodes: Arc<NodeLifecycleManager>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            orchestrator,
            nodes,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.sweep_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.sweep_interval, "Recovery sweep started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            let report = self.sweep_once(Utc::now()).await;
            if report.is_quiet() {
                debug!("Recovery sweep found nothing to do");
            } else {
                info!(?report, "Recovery sweep finished");
            }
        }
        info!("Recovery sweep stopped");
    }

    /// One full cycle as of `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.sweep_creating_workspaces(now).await {
            Ok(n) => report.workspaces_timed_out = n,
            Err(e) => error!(error = %e, "Workspace sweep failed"),
        }
        match self.sweep_stuck_runs(now).await {
            Ok(n) => report.runs_recovered = n,
            Err(e) => error!(error = %e, "Run sweep failed"),
        }
        match self.nodes.sweep_idle_nodes(now).await {
            Ok(n) => report.idle_nodes_destroyed = n,
            Err(e) => error!(error = %e, "Idle node sweep failed"),
        }
        match self.nodes.sweep_expired_nodes(now).await {
            Ok(n) => report.expired_nodes_destroyed = n,
            Err(e) => error!(error = %e, "Node lifetime sweep failed"),
        }
        match self.nodes.reap_destroying().await {
            Ok(n) => report.nodes_reaped = n,
            Err(e) => error!(error = %e, "Node teardown sweep failed"),
        }

        report
    }

    async fn sweep_creating_workspaces(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let timeout = to_chrono(self.config.workspace_creating_timeout);
        let mut timed_out = 0;
        for workspace in self
            .store
            .list_workspaces(Some(WorkspaceStatus::Creating))
            .await?
        {
            let age = now - workspace.created_at;
            if age < timeout {
                continue;
            }
            let patch = WorkspacePatch {
                status: Some(WorkspaceStatus::Error),
                error_message: Some(format!(
                    "workspace stuck in creating for {}s",
                    age.num_seconds()
                )),
                ..Default::default()
            };
            match self
                .store
                .update_workspace(&workspace.id, &[WorkspaceStatus::Creating], patch)
                .await
            {
                Ok(true) => {
                    warn!(workspace_id = %workspace.id, run_id = %workspace.run_id, "Workspace creation timed out");
                    timed_out += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(workspace_id = %workspace.id, error = %e, "Could not time out workspace"),
            }
        }
        Ok(timed_out)
    }

    async fn sweep_stuck_runs(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let executing = [RunStatus::Queued, RunStatus::Delegated, RunStatus::InProgress];
        let mut recovered = 0;
        for run in self.store.list_runs(&executing).await? {
            let Some(timeout) = self.config.stuck_timeout(run.status) else {
                continue;
            };
            let elapsed = now - run.updated_at;
            if elapsed < to_chrono(timeout) {
                continue;
            }

            let err = ExecutionError::StuckRunRecovered {
                status: run.status,
                elapsed_secs: elapsed.num_seconds(),
            };
            let message = err.persisted_message(run.execution_step);
            let patch = RunPatch::status(RunStatus::Failed)
                .with_error(message.clone())
                .with_completed_at(now);

            // Conditional on the status and attempt we judged stale: a run
            // that moved on since the listing is left alone.
            match self
                .store
                .update_run_attempt(&run.id, run.attempt, &[run.status], patch)
                .await
            {
                Ok(true) => {
                    error!(run_id = %run.id, status = %run.status, step = %run.step_label(), "Recovered stuck run");
                    self.orchestrator.cleanup(&run.id).await;
                    recovered += 1;
                }
                Ok(false) => debug!(run_id = %run.id, "Stuck run moved on before recovery"),
                Err(e) => warn!(run_id = %run.id, error = %e, "Could not recover stuck run"),
            }
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agentfleet_core::{
        ExecutionStep, LifecyclePhase, NewRun, NodeSpec, TaskRun, Workspace,
    };

    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{insert_running_node, test_config, FakeAgent, FakeProvisioner};

    struct Harness {
        store: Arc<dyn Store>,
        provisioner: Arc<FakeProvisioner>,
        nodes: Arc<NodeLifecycleManager>,
        orchestrator: Arc<Orchestrator>,
        sweep: RecoverySweep,
        config: Arc<Config>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(FakeProvisioner::default());
        let agent = Arc::new(FakeAgent::new());
        let config = Arc::new(test_config());
        let nodes = Arc::new(NodeLifecycleManager::new(
            store.clone(),
            provisioner.clone(),
            agent.clone(),
            config.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            nodes.clone(),
            agent,
            config.clone(),
        ));
        let sweep = RecoverySweep::new(
            store.clone(),
            orchestrator.clone(),
            nodes.clone(),
            config.clone(),
        );
        Harness {
            store,
            provisioner,
            nodes,
            orchestrator,
            sweep,
            config,
        }
    }

    /// Records as left by an execution that died right after writing
    /// `step` while the run was `status`.
    async fn abandoned_run(
        h: &Harness,
        status: RunStatus,
        step: ExecutionStep,
        auto_provisioned: bool,
    ) -> TaskRun {
        let node =
            insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), auto_provisioned)
                .await;
        h.store.reserve_node_slot(&node.id).await.unwrap();

        let mut run = TaskRun::new(NewRun::new("fix bug X", "repo"));
        let workspace = Workspace::new(node.id.clone(), run.id.clone(), "repo", "main");
        h.store.insert_workspace(&workspace).await.unwrap();
        run.status = status;
        run.execution_step = Some(step);
        run.node_id = Some(node.id);
        run.workspace_id = Some(workspace.id);
        h.store.insert_run(&run).await.unwrap();
        run
    }

    fn after(duration: Duration) -> DateTime<Utc> {
        Utc::now() + to_chrono(duration) + chrono::Duration::seconds(1)
    }

    #[tokio::test]
    async fn test_run_stalled_at_workspace_ready_is_failed() {
        let h = harness();
        let run =
            abandoned_run(&h, RunStatus::Delegated, ExecutionStep::WorkspaceReady, true).await;

        // Not yet past the delegated threshold.
        assert_eq!(h.sweep.sweep_once(Utc::now()).await.runs_recovered, 0);

        let recovered = h
            .sweep
            .sweep_stuck_runs(after(h.config.delegated_timeout))
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let stored = h.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        let message = stored.error_message.unwrap();
        assert!(message.starts_with("StuckRunRecovered: run stuck in delegated"), "{message}");
        assert!(message.contains("workspace_ready"), "{message}");
        assert_eq!(stored.execution_step, Some(ExecutionStep::WorkspaceReady));

        // Cleanup released the slot and parked the node.
        let node = h
            .store
            .get_node(stored.node_id.as_ref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(node.active_workspaces, 0);
        assert_eq!(node.phase, LifecyclePhase::Warm);

        // A late orchestrator write loses.
        assert!(!h
            .store
            .update_run(&run.id, &[RunStatus::Delegated], RunPatch::status(RunStatus::InProgress))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_thresholds_differ_per_status() {
        let h = harness();
        let delegated =
            abandoned_run(&h, RunStatus::Delegated, ExecutionStep::AgentSession, false).await;
        let in_progress =
            abandoned_run(&h, RunStatus::InProgress, ExecutionStep::Running, false).await;

        let report = h.sweep.sweep_once(after(h.config.delegated_timeout)).await;
        assert_eq!(report.runs_recovered, 1);
        assert_eq!(
            h.store.get_run(&delegated.id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
        assert_eq!(
            h.store.get_run(&in_progress.id).await.unwrap().unwrap().status,
            RunStatus::InProgress
        );

        let report = h.sweep.sweep_once(after(h.config.in_progress_timeout)).await;
        assert_eq!(report.runs_recovered, 1);
        let stored = h.store.get_run(&in_progress.id).await.unwrap().unwrap();
        assert!(stored.error_message.unwrap().contains("(execution step: running)"));
    }

    #[tokio::test]
    async fn test_creating_workspace_times_out_first() {
        let h = harness();
        let run =
            abandoned_run(&h, RunStatus::Queued, ExecutionStep::WorkspaceCreation, false).await;
        let workspace_id = run.workspace_id.clone().unwrap();

        // Past the creating timeout but not the queued one.
        let report = h.sweep.sweep_once(after(h.config.workspace_creating_timeout)).await;
        assert_eq!(report.workspaces_timed_out, 1);
        assert_eq!(report.runs_recovered, 0);
        let workspace = h.store.get_workspace(&workspace_id).await.unwrap().unwrap();
        assert_eq!(workspace.status, WorkspaceStatus::Error);
        assert!(workspace.error_message.unwrap().starts_with("workspace stuck in creating"));
    }

    #[tokio::test]
    async fn test_warm_node_without_timer_destroyed_by_sweep() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.nodes.mark_idle(&node.id).await.unwrap();
        h.nodes.timers().cancel(&node.id).await;

        let report = h
            .sweep
            .sweep_once(after(h.config.warm_idle_timeout + h.config.warm_grace))
            .await;
        assert_eq!(report.idle_nodes_destroyed, 1);
        assert_eq!(report.nodes_reaped, 1);
        assert!(h.store.get_node(&node.id).await.unwrap().is_none());
        assert_eq!(h.provisioner.destroyed(), vec![format!("i-{}", node.id)]);
    }

    #[tokio::test]
    async fn test_sweep_and_orchestrator_single_winner() {
        let h = harness();
        let run = abandoned_run(&h, RunStatus::Queued, ExecutionStep::NodeSelection, false).await;
        let node_id = run.node_id.clone().unwrap();
        // A second tenant keeps the node busy, so a double release would show.
        assert!(h.store.reserve_node_slot(&node_id).await.unwrap());

        let sweep = h.sweep.sweep_once(after(h.config.queued_timeout));
        let error = ExecutionError::ProvisioningFailed("quota exceeded".into());
        let orchestrator = h.orchestrator.fail_run(&run.id, run.attempt, &error);
        let (report, orchestrator_won) = tokio::join!(sweep, orchestrator);

        assert_eq!(report.runs_recovered + usize::from(orchestrator_won), 1);
        let stored = h.store.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        let node = h.store.get_node(&node_id).await.unwrap().unwrap();
        assert_eq!(node.active_workspaces, 1);
        assert_eq!(node.phase, LifecyclePhase::Active);
    }
}

//! Node lifecycle manager.
//!
//! Governs the `active -> warm -> destroying` phases of every node. A node's
//! state lives entirely in its durable record; this manager is a stateless
//! service over those records plus the volatile [`TimerService`]. Every phase
//! change is a conditional write, so concurrent claims, timer firings and
//! sweeps never both win.
//!
//! Orphaned compute is reclaimed by three independent layers:
//! 1. the per-node reclamation timer armed by [`NodeLifecycleManager::mark_idle`],
//! 2. [`NodeLifecycleManager::sweep_idle_nodes`] for nodes still warm past
//!    `warm_idle_timeout + warm_grace`,
//! 3. [`NodeLifecycleManager::sweep_expired_nodes`] for auto-provisioned nodes
//!    past `node_max_lifetime` in any phase.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentfleet_core::{LifecyclePhase, Node, NodeId, NodeSpec, NodeStatus};

use crate::agent_client::AgentEndpoint;
use crate::config::{to_chrono, Config};
use crate::provisioner::{NodeRequest, ProvisionerError, ResourceProvisioner};
use crate::store::{NodeCondition, NodePatch, Store, StoreError};
use crate::timer::TimerService;

/// Node lifecycle errors.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provisioner error: {0}")]
    Provisioner(#[from] ProvisionerError),

    #[error("node {node_id} not healthy after {waited:?}")]
    HealthTimeout { node_id: NodeId, waited: Duration },

    #[error("node {0} disappeared")]
    Vanished(NodeId),
}

pub struct NodeLifecycleManager {
    store: Arc<dyn Store>,
    provisioner: Arc<dyn ResourceProvisioner>,
    agents: Arc<dyn AgentEndpoint>,
    timers: TimerService,
    config: Arc<Config>,
}

impl NodeLifecycleManager {
    pub fn new(
        store: Arc<dyn Store>,
        provisioner: Arc<dyn ResourceProvisioner>,
        agents: Arc<dyn AgentEndpoint>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            provisioner,
            agents,
            timers: TimerService::new(),
            config,
        }
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    /// Cancel any pending timer and move the node to `active`.
    ///
    /// Returns `false` if the node is gone or already `destroying`; a node
    /// being torn down is never handed out again.
    pub async fn mark_active(&self, node_id: &NodeId) -> Result<bool, StoreError> {
        self.timers.cancel(node_id).await;
        let updated = self
            .store
            .update_node(
                node_id,
                NodeCondition::phase(&[LifecyclePhase::Active, LifecyclePhase::Warm]),
                NodePatch {
                    phase: Some(LifecyclePhase::Active),
                    warm_since: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        if updated {
            debug!(node_id = %node_id, "Node marked active");
        }
        Ok(updated)
    }

    /// Move an idle node to `warm` and arm its reclamation timer.
    ///
    /// Refused while the node still hosts workspaces. Idempotent for a node
    /// that is already warm.
    pub async fn mark_idle(&self, node_id: &NodeId) -> Result<bool, StoreError> {
        let now = Utc::now();
        let updated = self
            .store
            .update_node(
                node_id,
                NodeCondition::phase(&[LifecyclePhase::Active]).idle(),
                NodePatch {
                    phase: Some(LifecyclePhase::Warm),
                    warm_since: Some(Some(now)),
                    ..Default::default()
                },
            )
            .await?;

        if updated {
            let due = now + to_chrono(self.config.warm_idle_timeout);
            self.timers.arm(node_id, due).await;
            info!(node_id = %node_id, due = %due, "Node returned to warm pool");
            return Ok(true);
        }

        let already_warm = self
            .store
            .get_node(node_id)
            .await?
            .is_some_and(|node| node.phase == LifecyclePhase::Warm);
        if !already_warm {
            debug!(node_id = %node_id, "Node not idle; staying out of warm pool");
        }
        Ok(already_warm)
    }

    /// Atomically take a warm node matching the constraints.
    ///
    /// Safe under concurrent callers: the `warm -> active` transition is a
    /// conditional write, so exactly one caller wins each node.
    pub async fn try_claim(
        &self,
        size: Option<&str>,
        location: Option<&str>,
    ) -> Result<Option<NodeId>, StoreError> {
        let candidates = self.store.list_nodes(Some(LifecyclePhase::Warm)).await?;
        for node in candidates
            .into_iter()
            .filter(|n| n.status == NodeStatus::Running && n.matches(size, location))
        {
            let claimed = self
                .store
                .update_node(
                    &node.id,
                    NodeCondition::phase(&[LifecyclePhase::Warm]),
                    NodePatch {
                        phase: Some(LifecyclePhase::Active),
                        warm_since: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
            if claimed {
                self.timers.cancel(&node.id).await;
                info!(node_id = %node.id, "Claimed warm node");
                return Ok(Some(node.id));
            }
            debug!(node_id = %node.id, "Warm node claimed by someone else");
        }
        Ok(None)
    }

    /// Reclamation timer for `node_id` fired: `warm -> destroying`.
    pub async fn on_timer_fired(&self, node_id: &NodeId) -> Result<bool, StoreError> {
        let destroyed = self.begin_destroy(node_id, &[LifecyclePhase::Warm], true).await?;
        if destroyed {
            info!(node_id = %node_id, "Reclamation timer fired; node destroying");
        } else {
            debug!(node_id = %node_id, "Reclamation timer fired for node no longer warm");
        }
        Ok(destroyed)
    }

    /// Fire every timer due at `now`.
    pub async fn fire_due_timers(&self, now: DateTime<Utc>) -> usize {
        let mut fired = 0;
        for node_id in self.timers.pop_due(now).await {
            match self.on_timer_fired(&node_id).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e) => warn!(node_id = %node_id, error = %e, "Failed to handle reclamation timer"),
            }
        }
        fired
    }

    /// Scheduler loop driving the timer service.
    pub async fn run_timers(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.timer_tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }
            self.fire_due_timers(Utc::now()).await;
        }
        info!("Node timer loop stopped");
    }

    /// Re-arm timers for warm nodes after a restart.
    pub async fn restore_timers(&self) -> Result<usize, StoreError> {
        let warm = self.store.list_nodes(Some(LifecyclePhase::Warm)).await?;
        let timeout = to_chrono(self.config.warm_idle_timeout);
        for node in &warm {
            let due = node.warm_since.unwrap_or_else(Utc::now) + timeout;
            self.timers.arm(&node.id, due).await;
        }
        if !warm.is_empty() {
            info!(count = warm.len(), "Restored node reclamation timers");
        }
        Ok(warm.len())
    }

    /// Destroy nodes still warm past their timer plus grace.
    pub async fn sweep_idle_nodes(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let cutoff = to_chrono(self.config.warm_idle_timeout) + to_chrono(self.config.warm_grace);
        let mut destroyed = 0;
        for node in self.store.list_nodes(Some(LifecyclePhase::Warm)).await? {
            let warm_since = node.warm_since.unwrap_or(node.updated_at);
            if now - warm_since < cutoff {
                continue;
            }
            match self.begin_destroy(&node.id, &[LifecyclePhase::Warm], true).await {
                Ok(true) => {
                    self.timers.cancel(&node.id).await;
                    warn!(node_id = %node.id, warm_since = %warm_since, "Warm node missed its timer; destroying");
                    destroyed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(node_id = %node.id, error = %e, "Idle sweep failed for node"),
            }
        }
        Ok(destroyed)
    }

    /// Destroy auto-provisioned nodes past their absolute lifetime.
    pub async fn sweep_expired_nodes(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let max_lifetime = to_chrono(self.config.node_max_lifetime);
        let mut destroyed = 0;
        for node in self.store.list_nodes(None).await? {
            if !node.auto_provisioned
                || node.phase == LifecyclePhase::Destroying
                || now - node.created_at < max_lifetime
            {
                continue;
            }
            match self
                .begin_destroy(
                    &node.id,
                    &[LifecyclePhase::Active, LifecyclePhase::Warm],
                    false,
                )
                .await
            {
                Ok(true) => {
                    self.timers.cancel(&node.id).await;
                    warn!(
                        node_id = %node.id,
                        phase = %node.phase,
                        active_workspaces = node.active_workspaces,
                        "Node exceeded max lifetime; destroying"
                    );
                    destroyed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(node_id = %node.id, error = %e, "Lifetime sweep failed for node"),
            }
        }
        Ok(destroyed)
    }

    /// Physically tear down `destroying` nodes and drop their records.
    /// Failures are retried on the next cycle.
    pub async fn reap_destroying(&self) -> Result<usize, StoreError> {
        let mut reaped = 0;
        for node in self.store.list_nodes(Some(LifecyclePhase::Destroying)).await? {
            if let Some(instance_id) = &node.instance_id {
                if let Err(e) = self.provisioner.destroy_node(instance_id).await {
                    warn!(node_id = %node.id, instance_id = %instance_id, error = %e, "Node teardown failed; will retry");
                    continue;
                }
            }
            if self.store.delete_node(&node.id).await? {
                info!(node_id = %node.id, "Node destroyed");
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    /// Record a new auto-provisioned node in `creating`.
    pub async fn register(&self, spec: NodeSpec) -> Result<Node, StoreError> {
        let node = Node::new(spec, self.config.node_capacity, true);
        self.store.insert_node(&node).await?;
        Ok(node)
    }

    /// Ask the provisioner for the instance behind a registered node.
    pub async fn provision(&self, node: &Node) -> Result<Node, NodeError> {
        let request = NodeRequest {
            node_id: node.id.clone(),
            size: node.size.clone(),
            location: node.location.clone(),
        };
        let provisioned = match self.provisioner.create_node(request).await {
            Ok(provisioned) => provisioned,
            Err(e) => {
                error!(node_id = %node.id, error = %e, "Provisioning failed");
                self.abandon(&node.id).await;
                return Err(e.into());
            }
        };

        self.store
            .update_node(
                &node.id,
                NodeCondition::any(),
                NodePatch {
                    address: Some(provisioned.address.clone()),
                    instance_id: Some(provisioned.instance_id.clone()),
                    ..Default::default()
                },
            )
            .await?;
        self.store
            .get_node(&node.id)
            .await?
            .ok_or_else(|| NodeError::Vanished(node.id.clone()))
    }

    /// Poll the node's agent until it answers, then mark it `running`.
    pub async fn await_healthy(&self, node: &Node) -> Result<(), NodeError> {
        let address = node
            .address
            .as_deref()
            .ok_or_else(|| NodeError::Vanished(node.id.clone()))?;
        let started = tokio::time::Instant::now();

        loop {
            match self.agents.health(address).await {
                Ok(_) => {
                    let now = Utc::now();
                    self.store
                        .update_node(
                            &node.id,
                            NodeCondition::phase(&[LifecyclePhase::Active]),
                            NodePatch {
                                status: Some(NodeStatus::Running),
                                last_heartbeat: Some(now),
                                ..Default::default()
                            },
                        )
                        .await?;
                    info!(node_id = %node.id, waited = ?started.elapsed(), "Node agent healthy");
                    return Ok(());
                }
                Err(e) => debug!(node_id = %node.id, error = %e, "Node agent not ready yet"),
            }

            if started.elapsed() >= self.config.node_health_timeout {
                self.abandon(&node.id).await;
                return Err(NodeError::HealthTimeout {
                    node_id: node.id.clone(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.config.node_health_poll_interval).await;
        }
    }

    async fn begin_destroy(
        &self,
        node_id: &NodeId,
        phases: &[LifecyclePhase],
        idle_only: bool,
    ) -> Result<bool, StoreError> {
        let mut condition = NodeCondition::phase(phases);
        if idle_only {
            condition = condition.idle();
        }
        self.store
            .update_node(
                node_id,
                condition,
                NodePatch {
                    status: Some(NodeStatus::Stopped),
                    phase: Some(LifecyclePhase::Destroying),
                    warm_since: Some(None),
                    ..Default::default()
                },
            )
            .await
    }

    /// Hand a node that never became usable to the teardown sweep.
    async fn abandon(&self, node_id: &NodeId) {
        let result = self
            .store
            .update_node(
                node_id,
                NodeCondition::phase(&[LifecyclePhase::Active]),
                NodePatch {
                    status: Some(NodeStatus::Error),
                    phase: Some(LifecyclePhase::Destroying),
                    ..Default::default()
                },
            )
            .await;
        if let Err(e) = result {
            warn!(node_id = %node_id, error = %e, "Failed to mark node for teardown");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{insert_running_node, test_config, FakeAgent, FakeProvisioner};

    struct Harness {
        store: Arc<dyn Store>,
        provisioner: Arc<FakeProvisioner>,
        agent: Arc<FakeAgent>,
        manager: Arc<NodeLifecycleManager>,
        config: Arc<Config>,
    }

    fn harness() -> Harness {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let provisioner = Arc::new(FakeProvisioner::default());
        let agent = Arc::new(FakeAgent::new());
        let config = Arc::new(test_config());
        let manager = Arc::new(NodeLifecycleManager::new(
            store.clone(),
            provisioner.clone(),
            agent.clone(),
            config.clone(),
        ));
        Harness {
            store,
            provisioner,
            agent,
            manager,
            config,
        }
    }

    async fn phase_of(h: &Harness, id: &NodeId) -> LifecyclePhase {
        h.store.get_node(id).await.unwrap().unwrap().phase
    }

    #[tokio::test]
    async fn test_mark_idle_arms_timer() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;

        assert!(h.manager.mark_idle(&node.id).await.unwrap());
        let stored = h.store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, LifecyclePhase::Warm);
        let warm_since = stored.warm_since.unwrap();
        assert_eq!(
            h.manager.timers().due_at(&node.id).await,
            Some(warm_since + to_chrono(h.config.warm_idle_timeout))
        );

        // Idempotent.
        assert!(h.manager.mark_idle(&node.id).await.unwrap());
        assert_eq!(h.manager.timers().len().await, 1);
    }

    #[tokio::test]
    async fn test_mark_idle_refused_while_busy() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        assert!(h.store.reserve_node_slot(&node.id).await.unwrap());

        assert!(!h.manager.mark_idle(&node.id).await.unwrap());
        assert_eq!(phase_of(&h, &node.id).await, LifecyclePhase::Active);
        assert_eq!(h.manager.timers().len().await, 0);
    }

    #[tokio::test]
    async fn test_mark_active_cancels_timer() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();

        assert!(h.manager.mark_active(&node.id).await.unwrap());
        assert!(h.manager.mark_active(&node.id).await.unwrap());
        assert_eq!(h.manager.timers().len().await, 0);
        let stored = h.store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, LifecyclePhase::Active);
        assert_eq!(stored.warm_since, None);
    }

    #[tokio::test]
    async fn test_try_claim_respects_constraints() {
        let h = harness();
        let fra = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        let ams = insert_running_node(h.store.as_ref(), NodeSpec::new("large", "ams"), true).await;
        h.manager.mark_idle(&fra.id).await.unwrap();
        h.manager.mark_idle(&ams.id).await.unwrap();

        assert_eq!(h.manager.try_claim(Some("small"), Some("ams")).await.unwrap(), None);
        assert_eq!(
            h.manager.try_claim(Some("large"), None).await.unwrap(),
            Some(ams.id.clone())
        );
        assert_eq!(phase_of(&h, &ams.id).await, LifecyclePhase::Active);
        assert_eq!(h.manager.timers().due_at(&ams.id).await, None);
        assert!(h.manager.timers().due_at(&fra.id).await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_try_claim_single_winner() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = h.manager.clone();
            handles.push(tokio::spawn(async move {
                manager.try_claim(Some("small"), Some("fra")).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_timer_moves_warm_node_to_destroying() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();
        let due = h.manager.timers().due_at(&node.id).await.unwrap();

        assert_eq!(h.manager.fire_due_timers(due - chrono::Duration::seconds(1)).await, 0);
        assert_eq!(h.manager.fire_due_timers(due).await, 1);

        let stored = h.store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.phase, LifecyclePhase::Destroying);
        assert_eq!(stored.status, NodeStatus::Stopped);

        // Physical teardown happens in the reaper, not on the timer.
        assert!(h.provisioner.destroyed().is_empty());
        assert_eq!(h.manager.reap_destroying().await.unwrap(), 1);
        assert_eq!(h.provisioner.destroyed(), vec![format!("i-{}", node.id)]);
        assert!(h.store.get_node(&node.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_timer_ignored_after_claim() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();
        let due = h.manager.timers().due_at(&node.id).await.unwrap();

        // A claim racing the timer: the timer's conditional write loses.
        h.manager.mark_active(&node.id).await.unwrap();
        assert!(!h.manager.on_timer_fired(&node.id).await.unwrap());
        assert_eq!(h.manager.fire_due_timers(due).await, 0);
        assert_eq!(phase_of(&h, &node.id).await, LifecyclePhase::Active);
    }

    #[tokio::test]
    async fn test_idle_sweep_catches_missed_timer() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();
        // Timer delivery lost, e.g. the process restarted.
        h.manager.timers().cancel(&node.id).await;

        let warm_since = h.store.get_node(&node.id).await.unwrap().unwrap().warm_since.unwrap();
        let timeout = to_chrono(h.config.warm_idle_timeout);
        let grace = to_chrono(h.config.warm_grace);

        assert_eq!(h.manager.sweep_idle_nodes(warm_since + timeout).await.unwrap(), 0);
        assert_eq!(
            h.manager
                .sweep_idle_nodes(warm_since + timeout + grace)
                .await
                .unwrap(),
            1
        );
        assert_eq!(phase_of(&h, &node.id).await, LifecyclePhase::Destroying);
    }

    #[tokio::test]
    async fn test_lifetime_sweep_ignores_phase() {
        let h = harness();
        let busy = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        let manual =
            insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), false).await;
        h.store.reserve_node_slot(&busy.id).await.unwrap();

        let later = busy.created_at + to_chrono(h.config.node_max_lifetime);
        assert_eq!(h.manager.sweep_expired_nodes(later).await.unwrap(), 1);
        assert_eq!(phase_of(&h, &busy.id).await, LifecyclePhase::Destroying);
        assert_eq!(phase_of(&h, &manual.id).await, LifecyclePhase::Active);
    }

    #[tokio::test]
    async fn test_restore_timers_from_warm_since() {
        let h = harness();
        let node = insert_running_node(h.store.as_ref(), NodeSpec::new("small", "fra"), true).await;
        h.manager.mark_idle(&node.id).await.unwrap();
        let warm_since = h.store.get_node(&node.id).await.unwrap().unwrap().warm_since.unwrap();

        let restarted = NodeLifecycleManager::new(
            h.store.clone(),
            h.provisioner.clone(),
            h.agent.clone(),
            h.config.clone(),
        );
        assert_eq!(restarted.restore_timers().await.unwrap(), 1);
        assert_eq!(
            restarted.timers().due_at(&node.id).await,
            Some(warm_since + to_chrono(h.config.warm_idle_timeout))
        );
    }

    #[tokio::test]
    async fn test_provision_and_health() {
        let h = harness();
        let node = h.manager.register(NodeSpec::new("small", "fra")).await.unwrap();
        assert_eq!(node.status, NodeStatus::Creating);

        let node = h.manager.provision(&node).await.unwrap();
        assert!(node.address.is_some());
        h.manager.await_healthy(&node).await.unwrap();

        let stored = h.store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Running);
        assert!(stored.last_heartbeat.is_some());
        assert_eq!(h.provisioner.created().len(), 1);
    }

    #[tokio::test]
    async fn test_health_timeout_abandons_node() {
        let h = harness();
        h.agent.healthy.store(false, Ordering::SeqCst);
        let node = h.manager.register(NodeSpec::new("small", "fra")).await.unwrap();
        let node = h.manager.provision(&node).await.unwrap();

        let err = h.manager.await_healthy(&node).await.unwrap_err();
        assert!(matches!(err, NodeError::HealthTimeout { .. }));

        let stored = h.store.get_node(&node.id).await.unwrap().unwrap();
        assert_eq!(stored.status, NodeStatus::Error);
        assert_eq!(stored.phase, LifecyclePhase::Destroying);
        assert_eq!(h.manager.reap_destroying().await.unwrap(), 1);
        assert_eq!(h.provisioner.destroyed().len(), 1);
    }

    #[tokio::test]
    async fn test_provisioner_failure_abandons_node() {
        let h = harness();
        h.provisioner.fail_create.store(true, Ordering::SeqCst);
        let node = h.manager.register(NodeSpec::new("small", "fra")).await.unwrap();

        assert!(matches!(
            h.manager.provision(&node).await,
            Err(NodeError::Provisioner(_))
        ));
        assert_eq!(phase_of(&h, &node.id).await, LifecyclePhase::Destroying);

        // No instance exists, so the reaper only drops the record.
        assert_eq!(h.manager.reap_destroying().await.unwrap(), 1);
        assert!(h.provisioner.destroyed().is_empty());
    }
}

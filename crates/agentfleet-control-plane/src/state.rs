//! Shared application state.

use std::sync::Arc;

use crate::agent_client::AgentEndpoint;
use crate::config::Config;
use crate::node_lifecycle::NodeLifecycleManager;
use crate::orchestrator::Orchestrator;
use crate::provisioner::ResourceProvisioner;
use crate::recovery::RecoverySweep;
use crate::store::Store;

/// Shared application state.
pub struct AppState {
    /// Durable records.
    pub store: Arc<dyn Store>,

    /// Run state machine and callback handling.
    pub orchestrator: Arc<Orchestrator>,

    /// Warm pool and node reclamation.
    pub nodes: Arc<NodeLifecycleManager>,

    /// Periodic recovery of stuck records.
    pub recovery: Arc<RecoverySweep>,

    pub config: Arc<Config>,
}

impl AppState {
    /// Wire the services together over one store.
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        provisioner: Arc<dyn ResourceProvisioner>,
        agents: Arc<dyn AgentEndpoint>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let nodes = Arc::new(NodeLifecycleManager::new(
            store.clone(),
            provisioner,
            agents.clone(),
            config.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            nodes.clone(),
            agents,
            config.clone(),
        ));
        let recovery = Arc::new(RecoverySweep::new(
            store.clone(),
            orchestrator.clone(),
            nodes.clone(),
            config.clone(),
        ));

        Arc::new(Self {
            store,
            orchestrator,
            nodes,
            recovery,
            config,
        })
    }
}

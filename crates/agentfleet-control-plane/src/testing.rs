//! Test doubles for the provisioner and remote agents.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use agentfleet_core::protocol::{
    AgentHealth, CreateSessionRequest, CreateWorkspaceRequest, StartSessionRequest,
    StartSessionResponse,
};
use agentfleet_core::{Node, NodeSpec, NodeStatus, SessionId, WorkspaceId, WorkspaceStatus};

use crate::agent_client::{AgentClientError, AgentEndpoint};
use crate::config::Config;
use crate::provisioner::{NodeRequest, ProvisionedNode, ProvisionerError, ResourceProvisioner};
use crate::state::AppState;
use crate::store::{MemoryStore, Store, WorkspacePatch};

/// Config with intervals short enough for tests.
pub fn test_config() -> Config {
    Config {
        public_url: "http://cp.test".into(),
        default_node: NodeSpec::new("small", "fra"),
        node_health_poll_interval: Duration::from_millis(10),
        node_health_timeout: Duration::from_millis(500),
        workspace_poll_initial: Duration::from_millis(10),
        workspace_poll_max: Duration::from_millis(40),
        workspace_ready_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Application state over an in-memory store, with fakes for the outside
/// world. The agent marks workspaces ready as soon as they are requested.
pub fn test_state() -> (Arc<AppState>, Arc<FakeAgent>, Arc<FakeProvisioner>) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let agent = Arc::new(FakeAgent::auto_ready(store.clone()));
    let provisioner = Arc::new(FakeProvisioner::default());
    let state = AppState::new(test_config(), store, provisioner.clone(), agent.clone());
    (state, agent, provisioner)
}

/// Insert a healthy node that can take workspaces.
pub async fn insert_running_node(
    store: &dyn Store,
    spec: NodeSpec,
    auto_provisioned: bool,
) -> Node {
    let mut node = Node::new(spec, 2, auto_provisioned);
    node.status = NodeStatus::Running;
    node.address = Some(format!("http://{}.agents.test", node.id));
    node.instance_id = Some(format!("i-{}", node.id));
    store.insert_node(&node).await.unwrap();
    node
}

#[derive(Default)]
pub struct FakeProvisioner {
    created: Mutex<Vec<NodeRequest>>,
    destroyed: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
}

impl FakeProvisioner {
    pub fn created(&self) -> Vec<NodeRequest> {
        self.created.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResourceProvisioner for FakeProvisioner {
    async fn create_node(&self, request: NodeRequest) -> Result<ProvisionedNode, ProvisionerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProvisionerError::Rejected("quota exceeded".into()));
        }
        let node = ProvisionedNode {
            instance_id: format!("i-{}", request.node_id),
            address: format!("http://{}.agents.test", request.node_id),
        };
        self.created.lock().unwrap().push(request);
        Ok(node)
    }

    async fn destroy_node(&self, instance_id: &str) -> Result<(), ProvisionerError> {
        self.destroyed.lock().unwrap().push(instance_id.to_string());
        Ok(())
    }
}

/// A call observed by [`FakeAgent`].
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Health(String),
    CreateWorkspace(CreateWorkspaceRequest),
    CreateSession {
        workspace_id: WorkspaceId,
        request: CreateSessionRequest,
    },
    StartSession {
        workspace_id: WorkspaceId,
        session_id: SessionId,
        request: StartSessionRequest,
    },
    StopWorkspace(WorkspaceId),
}

/// Records every call. With a store attached, workspace requests are marked
/// ready immediately, as if the readiness callback had already landed.
pub struct FakeAgent {
    calls: Mutex<Vec<AgentCall>>,
    ready_store: Option<Arc<dyn Store>>,
    pub healthy: AtomicBool,
    pub fail_create_workspace: AtomicBool,
    pub fail_start: AtomicBool,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            ready_store: None,
            healthy: AtomicBool::new(true),
            fail_create_workspace: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
        }
    }

    pub fn auto_ready(store: Arc<dyn Store>) -> Self {
        Self {
            ready_store: Some(store),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn workspace_requests(&self) -> Vec<CreateWorkspaceRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::CreateWorkspace(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn start_requests(&self) -> Vec<StartSessionRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                AgentCall::StartSession { request, .. } => Some(request),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AgentCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn failure(status: u16) -> AgentClientError {
        AgentClientError::Status {
            status,
            body: "injected failure".into(),
        }
    }
}

#[async_trait]
impl AgentEndpoint for FakeAgent {
    async fn health(&self, address: &str) -> Result<AgentHealth, AgentClientError> {
        self.record(AgentCall::Health(address.to_string()));
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(Self::failure(503));
        }
        Ok(AgentHealth {
            status: "ok".into(),
            node_id: None,
        })
    }

    async fn create_workspace(
        &self,
        _address: &str,
        request: &CreateWorkspaceRequest,
    ) -> Result<(), AgentClientError> {
        self.record(AgentCall::CreateWorkspace(request.clone()));
        if self.fail_create_workspace.load(Ordering::SeqCst) {
            return Err(Self::failure(500));
        }
        if let Some(store) = &self.ready_store {
            store
                .update_workspace(
                    &request.workspace_id,
                    &[WorkspaceStatus::Creating],
                    WorkspacePatch {
                        status: Some(WorkspaceStatus::Running),
                        ready_at: Some(Utc::now()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        Ok(())
    }

    async fn create_agent_session(
        &self,
        _address: &str,
        workspace_id: &WorkspaceId,
        request: &CreateSessionRequest,
    ) -> Result<(), AgentClientError> {
        self.record(AgentCall::CreateSession {
            workspace_id: workspace_id.clone(),
            request: request.clone(),
        });
        Ok(())
    }

    async fn start_agent_session(
        &self,
        _address: &str,
        workspace_id: &WorkspaceId,
        session_id: &SessionId,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, AgentClientError> {
        self.record(AgentCall::StartSession {
            workspace_id: workspace_id.clone(),
            session_id: session_id.clone(),
            request: request.clone(),
        });
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Self::failure(500));
        }
        Ok(StartSessionResponse {
            session_id: session_id.clone(),
            already_started: false,
        })
    }

    async fn stop_workspace(
        &self,
        _address: &str,
        workspace_id: &WorkspaceId,
    ) -> Result<(), AgentClientError> {
        self.record(AgentCall::StopWorkspace(workspace_id.clone()));
        Ok(())
    }
}

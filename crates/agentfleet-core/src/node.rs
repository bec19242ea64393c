//! Compute node record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LifecyclePhase, NodeId, NodeStatus};

/// Size and location of a node; used both for provisioning and for matching
/// warm nodes against a run's constraints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSpec {
    pub size: String,
    pub location: String,
}

impl NodeSpec {
    pub fn new(size: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            size: size.into(),
            location: location.into(),
        }
    }
}

/// A compute instance hosting one or more workspaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    pub status: NodeStatus,
    pub phase: LifecyclePhase,
    /// Base URL of the node's remote agent; set once provisioning succeeds.
    pub address: Option<String>,
    /// Provisioner-side reference used for teardown.
    pub instance_id: Option<String>,
    pub size: String,
    pub location: String,
    pub active_workspaces: u32,
    pub max_workspaces: u32,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub auto_provisioned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the node last entered `warm`; `None` outside the warm phase.
    pub warm_since: Option<DateTime<Utc>>,
}

impl Node {
    /// Create a node record in `creating`, owned by the run that provisions it.
    pub fn new(spec: NodeSpec, max_workspaces: u32, auto_provisioned: bool) -> Self {
        let now = Utc::now();
        Self {
            id: NodeId::generate(),
            status: NodeStatus::Creating,
            phase: LifecyclePhase::Active,
            address: None,
            instance_id: None,
            size: spec.size,
            location: spec.location,
            active_workspaces: 0,
            max_workspaces,
            last_heartbeat: None,
            auto_provisioned,
            created_at: now,
            updated_at: now,
            warm_since: None,
        }
    }

    /// Builder method to set a specific ID (useful for testing).
    pub fn with_id(mut self, id: NodeId) -> Self {
        self.id = id;
        self
    }

    /// Whether another workspace may be placed on this node.
    pub fn has_capacity(&self) -> bool {
        self.status == NodeStatus::Running
            && self.phase != LifecyclePhase::Destroying
            && self.active_workspaces < self.max_workspaces
    }

    /// Whether the node satisfies optional size/location constraints.
    pub fn matches(&self, size: Option<&str>, location: Option<&str>) -> bool {
        size.map_or(true, |s| s == self.size) && location.map_or(true, |l| l == self.location)
    }
}

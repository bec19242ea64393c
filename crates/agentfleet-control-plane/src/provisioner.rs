//! Resource provisioner client.
//!
//! The provisioner is an external service that creates and destroys compute
//! instances. The control plane only ever asks for "a node of this size in
//! this location" and later "destroy that instance".

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use agentfleet_core::NodeId;

/// Provisioner errors.
#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provisioner returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provisioner rejected request: {0}")]
    Rejected(String),
}

/// A node creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRequest {
    pub node_id: NodeId,
    pub size: String,
    pub location: String,
}

/// A freshly created compute instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedNode {
    pub instance_id: String,
    /// Base URL of the remote agent running on the instance.
    pub address: String,
}

#[async_trait]
pub trait ResourceProvisioner: Send + Sync {
    async fn create_node(&self, request: NodeRequest) -> Result<ProvisionedNode, ProvisionerError>;

    /// Destroy an instance. Destroying an instance that no longer exists
    /// succeeds.
    async fn destroy_node(&self, instance_id: &str) -> Result<(), ProvisionerError>;
}

/// Provisioner reached over HTTP.
pub struct HttpProvisioner {
    inner: reqwest::Client,
    base_url: String,
}

impl HttpProvisioner {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProvisionerError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            inner,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ResourceProvisioner for HttpProvisioner {
    async fn create_node(&self, request: NodeRequest) -> Result<ProvisionedNode, ProvisionerError> {
        let url = format!("{}/nodes", self.base_url);
        debug!(url = %url, node_id = %request.node_id, "Creating node");

        let response = self.inner.post(&url).json(&request).send().await?;
        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionerError::Rejected(body));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionerError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let node: ProvisionedNode = response.json().await?;
        info!(
            node_id = %request.node_id,
            instance_id = %node.instance_id,
            address = %node.address,
            "Node created"
        );
        Ok(node)
    }

    async fn destroy_node(&self, instance_id: &str) -> Result<(), ProvisionerError> {
        let url = format!("{}/nodes/{}", self.base_url, instance_id);
        debug!(url = %url, "Destroying node");

        let response = self.inner.delete(&url).send().await?;
        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProvisionerError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

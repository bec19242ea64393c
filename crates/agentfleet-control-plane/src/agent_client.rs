//! Client for the remote agent running on each node.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use agentfleet_core::protocol::{
    AgentHealth, CreateSessionRequest, CreateWorkspaceRequest, StartSessionRequest,
    StartSessionResponse,
};
use agentfleet_core::{SessionId, WorkspaceId};

/// Remote agent errors.
#[derive(Debug, Error)]
pub enum AgentClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl AgentClientError {
    /// HTTP status returned by the agent, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentClientError::Status { status, .. } => Some(*status),
            AgentClientError::Http(e) => e.status().map(|s| s.as_u16()),
        }
    }
}

/// Operations the control plane invokes on a remote agent at `address`.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    async fn health(&self, address: &str) -> Result<AgentHealth, AgentClientError>;

    /// Ask for a workspace. Acknowledged immediately; readiness arrives
    /// through a callback.
    async fn create_workspace(
        &self,
        address: &str,
        request: &CreateWorkspaceRequest,
    ) -> Result<(), AgentClientError>;

    /// Register a session record. Does not launch anything.
    async fn create_agent_session(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
        request: &CreateSessionRequest,
    ) -> Result<(), AgentClientError>;

    /// Launch the worker process and hand it the instruction.
    async fn start_agent_session(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
        session_id: &SessionId,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, AgentClientError>;

    /// Tear the workspace down. Unknown workspaces are not an error.
    async fn stop_workspace(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
    ) -> Result<(), AgentClientError>;
}

/// [`AgentEndpoint`] over HTTP.
pub struct HttpAgentClient {
    inner: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentClientError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { inner })
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl AgentEndpoint for HttpAgentClient {
    async fn health(&self, address: &str) -> Result<AgentHealth, AgentClientError> {
        let url = Self::url(address, "/health");
        debug!(url = %url, "Probing agent health");

        let response = Self::check(self.inner.get(&url).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn create_workspace(
        &self,
        address: &str,
        request: &CreateWorkspaceRequest,
    ) -> Result<(), AgentClientError> {
        let url = Self::url(address, "/workspaces");
        debug!(url = %url, workspace_id = %request.workspace_id, "Requesting workspace");

        Self::check(self.inner.post(&url).json(request).send().await?).await?;
        Ok(())
    }

    async fn create_agent_session(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
        request: &CreateSessionRequest,
    ) -> Result<(), AgentClientError> {
        let url = Self::url(address, &format!("/workspaces/{}/agent-sessions", workspace_id));
        debug!(url = %url, session_id = %request.session_id, "Registering agent session");

        Self::check(self.inner.post(&url).json(request).send().await?).await?;
        Ok(())
    }

    async fn start_agent_session(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
        session_id: &SessionId,
        request: &StartSessionRequest,
    ) -> Result<StartSessionResponse, AgentClientError> {
        let url = Self::url(
            address,
            &format!("/workspaces/{}/agent-sessions/{}/start", workspace_id, session_id),
        );
        debug!(url = %url, "Starting agent session");

        let response = Self::check(self.inner.post(&url).json(request).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn stop_workspace(
        &self,
        address: &str,
        workspace_id: &WorkspaceId,
    ) -> Result<(), AgentClientError> {
        let url = Self::url(address, &format!("/workspaces/{}", workspace_id));
        debug!(url = %url, "Stopping workspace");

        let response = self.inner.delete(&url).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use agentfleet_core::RunId;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client() -> HttpAgentClient {
        HttpAgentClient::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "status": "ok", "nodeId": "n1" })),
            )
            .mount(&server)
            .await;

        let health = client().health(&server.uri()).await.unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.node_id.unwrap().as_str(), "n1");
    }

    #[tokio::test]
    async fn test_create_and_start_are_separate_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws1/agent-sessions"))
            .and(body_json(serde_json::json!({ "sessionId": "s1", "label": "run r1" })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws1/agent-sessions/s1/start"))
            .and(body_json(serde_json::json!({
                "instruction": "fix bug X",
                "runId": "r1",
                "callbackUrl": "http://cp/tasks/r1/status/callback",
                "callbackToken": "tok"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sessionId": "s1",
                "alreadyStarted": false
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client();
        let workspace = WorkspaceId::new("ws1");
        let session = SessionId::new("s1");
        client
            .create_agent_session(
                &server.uri(),
                &workspace,
                &CreateSessionRequest {
                    session_id: session.clone(),
                    label: "run r1".into(),
                },
            )
            .await
            .unwrap();
        let started = client
            .start_agent_session(
                &server.uri(),
                &workspace,
                &session,
                &StartSessionRequest {
                    instruction: "fix bug X".into(),
                    run_id: RunId::new("r1"),
                    callback_url: "http://cp/tasks/r1/status/callback".into(),
                    callback_token: "tok".into(),
                },
            )
            .await
            .unwrap();
        assert!(!started.already_started);
    }

    #[tokio::test]
    async fn test_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces"))
            .respond_with(ResponseTemplate::new(500).set_body_string("disk full"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/workspaces/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client();
        let err = client
            .create_workspace(
                &server.uri(),
                &CreateWorkspaceRequest {
                    workspace_id: WorkspaceId::new("ws1"),
                    repository: "https://git.example.com/repo.git".into(),
                    branch: "main".into(),
                    callback_url: "http://cp/workspaces".into(),
                    callback_token: "tok".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(500));
        assert!(err.to_string().contains("disk full"));

        client
            .stop_workspace(&server.uri(), &WorkspaceId::new("gone"))
            .await
            .unwrap();
    }
}

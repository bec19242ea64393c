//! Callbacks to the control plane.
//!
//! Every callback carries the workspace's callback token as a bearer token.
//! Transport errors and 5xx responses are retried; a 4xx means the control
//! plane has made up its mind and is not retried.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use agentfleet_core::protocol::{ProvisioningFailedRequest, StatusCallbackRequest};
use agentfleet_core::WorkspaceId;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl CallbackError {
    fn is_retryable(&self) -> bool {
        match self {
            CallbackError::Http(_) => true,
            CallbackError::Status { status, .. } => *status >= 500,
        }
    }
}

pub struct ControlPlaneClient {
    inner: reqwest::Client,
    control_plane_url: String,
    attempts: u32,
    retry_delay: Duration,
}

impl ControlPlaneClient {
    pub fn new(
        control_plane_url: &str,
        timeout: Duration,
        attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self, CallbackError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            inner,
            control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
            attempts: attempts.max(1),
            retry_delay,
        })
    }

    /// Absolute URLs pass through; paths are joined to the control plane URL.
    fn resolve(&self, url: &str) -> String {
        if url.starts_with('/') {
            format!("{}{}", self.control_plane_url, url)
        } else {
            url.to_string()
        }
    }

    pub async fn workspace_ready(
        &self,
        callback_base: &str,
        workspace_id: &WorkspaceId,
        token: &str,
    ) -> Result<(), CallbackError> {
        let url = format!(
            "{}/{}/ready",
            self.resolve(callback_base).trim_end_matches('/'),
            workspace_id
        );
        self.post(&url, token, &serde_json::json!({})).await
    }

    pub async fn provisioning_failed(
        &self,
        callback_base: &str,
        workspace_id: &WorkspaceId,
        token: &str,
        reason: &str,
    ) -> Result<(), CallbackError> {
        let url = format!(
            "{}/{}/provisioning-failed",
            self.resolve(callback_base).trim_end_matches('/'),
            workspace_id
        );
        let body = ProvisioningFailedRequest {
            reason: reason.to_string(),
        };
        self.post(&url, token, &body).await
    }

    pub async fn report_status(
        &self,
        callback_url: &str,
        token: &str,
        request: &StatusCallbackRequest,
    ) -> Result<(), CallbackError> {
        let url = self.resolve(callback_url);
        self.post(&url, token, request).await
    }

    async fn post<T: Serialize + ?Sized>(
        &self,
        url: &str,
        token: &str,
        body: &T,
    ) -> Result<(), CallbackError> {
        let mut attempt = 1;
        loop {
            debug!(url = %url, attempt, "Sending callback");
            match self.post_once(url, token, body).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    warn!(url = %url, attempt, error = %e, "Callback failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn post_once<T: Serialize + ?Sized>(
        &self,
        url: &str,
        token: &str,
        body: &T,
    ) -> Result<(), CallbackError> {
        let response = self
            .inner
            .post(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(CallbackError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use agentfleet_core::RunStatus;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(base: &str) -> ControlPlaneClient {
        ControlPlaneClient::new(base, Duration::from_secs(5), 3, Duration::from_millis(10)).unwrap()
    }

    #[tokio::test]
    async fn test_workspace_ready_posts_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/ready"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let base = format!("{}/workspaces", server.uri());
        client(&server.uri())
            .workspace_ready(&base, &WorkspaceId::new("ws-1"), "tok")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_relative_callback_url_uses_control_plane() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/workspaces/ws-1/provisioning-failed"))
            .and(body_json(serde_json::json!({ "reason": "clone failed" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client(&server.uri())
            .provisioning_failed("/workspaces", &WorkspaceId::new("ws-1"), "tok", "clone failed")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_report_status_retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tasks/r1/status/callback"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/tasks/r1/status/callback"))
            .and(body_json(serde_json::json!({ "toStatus": "completed", "outputSummary": "done" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let request = StatusCallbackRequest {
            to_status: RunStatus::Completed,
            output_summary: Some("done".into()),
            output_branch: None,
        };
        client(&server.uri())
            .report_status(&format!("{}/tasks/r1/status/callback", server.uri()), "tok", &request)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid token"))
            .expect(1)
            .mount(&server)
            .await;

        let request = StatusCallbackRequest {
            to_status: RunStatus::Failed,
            output_summary: None,
            output_branch: None,
        };
        let err = client(&server.uri())
            .report_status("/tasks/r1/status/callback", "bad", &request)
            .await
            .unwrap_err();
        assert!(matches!(err, CallbackError::Status { status: 401, .. }));
    }
}

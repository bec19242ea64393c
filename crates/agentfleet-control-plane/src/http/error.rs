//! Mapping of domain errors onto HTTP responses.

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use agentfleet_core::CoreError;

use crate::http::responses::ErrorResponse;
use crate::orchestrator::OrchestratorError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err {
            OrchestratorError::RunNotFound(_) | OrchestratorError::WorkspaceNotFound(_) => {
                ApiError::NotFound(message)
            }
            OrchestratorError::Core(CoreError::InvalidStateTransition { .. })
            | OrchestratorError::DependenciesIncomplete(_)
            | OrchestratorError::Conflict(_) => ApiError::Conflict(message),
            OrchestratorError::Core(_) => ApiError::BadRequest(message),
            OrchestratorError::Unauthorized => ApiError::Unauthorized(message),
            OrchestratorError::Store(_) => ApiError::Internal(message),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| ApiError::Unauthorized("missing bearer token".to_string()))
}

#[cfg(test)]
mod tests {
    use agentfleet_core::{RunId, RunStatus};
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_orchestrator_errors_map_to_statuses() {
        let cases = [
            (
                OrchestratorError::RunNotFound(RunId::new("r1")),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::Core(CoreError::InvalidStateTransition {
                    from: RunStatus::Completed.to_string(),
                    to: RunStatus::Queued.to_string(),
                }),
                StatusCode::CONFLICT,
            ),
            (
                OrchestratorError::Core(CoreError::InvalidInput("instruction is required".into())),
                StatusCode::BAD_REQUEST,
            ),
            (OrchestratorError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                OrchestratorError::Conflict("run r1 is completed".into()),
                StatusCode::CONFLICT,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_bearer_token() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc");
    }
}

//! API error types with structured JSON responses.
//!
//! Every error leaves the process as `{ "error": { "kind", "message" } }`
//! — never a raw stack trace.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::agents::AgentError;
use crate::orchestrator::OrchestratorError;
use crate::providers::ProviderError;
use crate::router::RouterError;

/// Structured error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub kind: &'static str,
    pub message: String,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Authentication required")]
    Unauthorized,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Invalid session state: {0}")]
    InvalidState(String),
    #[error("Upstream backend error: {0}")]
    Upstream(String),
    #[error("Upstream backend timed out: {0}")]
    Timeout(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match &self {
            ApiError::UnknownModel(model) => (
                StatusCode::BAD_REQUEST,
                "unknown_model",
                format!("Model '{model}' is not available"),
            ),
            ApiError::BadRequest(detail) => {
                (StatusCode::BAD_REQUEST, "bad_request", detail.clone())
            }
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid API key".to_string(),
            ),
            ApiError::RateLimited { retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                format!("Rate limit exceeded. Retry after {retry_after}s"),
            ),
            ApiError::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                "session_not_found",
                format!("Session '{id}' not found"),
            ),
            ApiError::InvalidState(detail) => {
                (StatusCode::CONFLICT, "invalid_state", detail.clone())
            }
            ApiError::Upstream(detail) => {
                (StatusCode::BAD_GATEWAY, "upstream_error", detail.clone())
            }
            ApiError::Timeout(detail) => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", detail.clone())
            }
            ApiError::Internal(detail) => {
                tracing::error!(detail, "API internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: ErrorDetail { kind, message },
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after } = &self {
            if let Ok(val) = axum::http::HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::UnknownModel(model) => ApiError::UnknownModel(model),
        }
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout { .. } => ApiError::Timeout(err.to_string()),
            _ => ApiError::Upstream(err.to_string()),
        }
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Provider { source, .. } => ApiError::from(source),
            AgentError::Parse { .. } => ApiError::Upstream(err.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::SessionNotFound(id) => ApiError::SessionNotFound(id),
            OrchestratorError::InvalidState { .. } => ApiError::InvalidState(err.to_string()),
            OrchestratorError::Agent(agent) => ApiError::from(agent),
        }
    }
}

//! Error types for the gateway crate.

use ark_executor::ExecutorError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors that can occur during gateway request handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// An error propagated from the executor layer.
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// The request body is malformed or contains invalid values.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A path names a VM that cannot exist because the name is invalid.
    #[error("VM not found: {0}")]
    UnknownVm(String),

    /// An environment variable holds an unusable value.
    #[error("invalid configuration {var}: {reason}")]
    InvalidConfig { var: &'static str, reason: String },
}

impl GatewayError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Executor(e) => match e {
                ExecutorError::Validation(_) => StatusCode::BAD_REQUEST,
                ExecutorError::NotFound(_) => StatusCode::NOT_FOUND,
                ExecutorError::StateConflict { .. }
                | ExecutorError::TransitionInProgress(_)
                | ExecutorError::AlreadyExists(_) => StatusCode::CONFLICT,
                ExecutorError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                ExecutorError::SlotsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnknownVm(_) => StatusCode::NOT_FOUND,
            Self::InvalidConfig { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Semantic error category reported as `kind`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Executor(e) => e.kind(),
            Self::InvalidRequest(_) => "validation_error",
            Self::UnknownVm(_) => "not_found",
            Self::InvalidConfig { .. } => "internal_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        }
        (status, Json(json!({"error": self.to_string(), "kind": self.kind()}))).into_response()
    }
}

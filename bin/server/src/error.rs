//! Error types for the server binary and its HTTP API.
//!
//! - `ServerError`: startup and shutdown failures of the process
//! - `ApiError`: why a request failed, rendered as a JSON error body

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use flowforge_engine::EngineError;
use flowforge_integration::CredentialError;
use flowforge_workflow::VersionError;
use serde_json::json;
use std::fmt;

/// Errors that stop the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    /// Configuration could not be loaded.
    Config { reason: String },
    /// The credential key is not a valid AES-256 key.
    CredentialKey { reason: String },
    /// Connecting to or migrating the database failed.
    Database { reason: String },
    /// The engine could not be assembled.
    Engine { reason: String },
    /// The listener could not be bound or the server stopped unexpectedly.
    Serve { addr: String, reason: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { reason } => write!(f, "configuration error: {reason}"),
            Self::CredentialKey { reason } => write!(f, "invalid credential key: {reason}"),
            Self::Database { reason } => write!(f, "database error: {reason}"),
            Self::Engine { reason } => write!(f, "engine error: {reason}"),
            Self::Serve { addr, reason } => write!(f, "server on {addr} failed: {reason}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// A failed API request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    Engine(EngineError),
    Credential(CredentialError),
    /// A path or header value that does not parse.
    BadRequest { reason: String },
}

impl ApiError {
    #[must_use]
    pub fn bad_request(reason: impl fmt::Display) -> Self {
        Self::BadRequest {
            reason: reason.to_string(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::Engine(e) => match e {
                EngineError::WorkflowNotFound { .. }
                | EngineError::ExecutionNotFound { .. }
                | EngineError::WebhookNotFound { .. }
                | EngineError::Version(VersionError::VersionNotFound { .. }) => {
                    StatusCode::NOT_FOUND
                }
                EngineError::Version(VersionError::WorkflowMismatch { .. }) => {
                    StatusCode::BAD_REQUEST
                }
                EngineError::WorkflowInactive { .. }
                | EngineError::InvalidTransition(_)
                | EngineError::ExecutionActive { .. }
                | EngineError::Conflict { .. } => StatusCode::CONFLICT,
                EngineError::Persistence { .. } | EngineError::Setup { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::Credential(e) => match e {
                CredentialError::NotFound { .. } => StatusCode::NOT_FOUND,
                CredentialError::InvalidFormat { .. } => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Engine(e) => write!(f, "{e}"),
            Self::Credential(e) => write!(f, "{e}"),
            Self::BadRequest { reason } => write!(f, "bad request: {reason}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<&EngineError> for ApiError {
    fn from(e: &EngineError) -> Self {
        Self::Engine(e.clone())
    }
}

impl From<&CredentialError> for ApiError {
    fn from(e: &CredentialError) -> Self {
        Self::Credential(e.clone())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        let message = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            self.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

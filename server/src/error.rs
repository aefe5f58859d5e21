//! Error types for the terminal server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::http::response::Envelope;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the terminal server
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Authentication errors (2000-2999)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Token claim not found: {0}")]
    MissingClaim(String),

    // Provisioning errors (3000-3999)
    #[error("Failed to provision terminal pod: {0}")]
    Provisioning(String),

    #[error("Terminal pod {pod} not ready after {seconds}s")]
    ReadinessTimeout { pod: String, seconds: u64 },

    // Injection errors (4000-4999)
    #[error("Failed to inject credentials: {0}")]
    Injection(String),

    // Session and stream errors (5000-5999)
    #[error("Terminal session not found: {0}")]
    SessionNotFound(String),

    #[error("Terminal session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("Terminal session already bound: {0}")]
    SessionAlreadyBound(String),

    #[error("Terminal session closed: {0}")]
    SessionClosed(String),

    #[error("Terminal session {session} not attached within {seconds}s")]
    AttachTimeout { session: String, seconds: u64 },

    #[error("Exec stream error: {0}")]
    Stream(String),

    // Infrastructure errors (6000-6999)
    #[error("Kubernetes error: {0}")]
    Kube(String),

    // General errors (1000-1999)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Authentication errors (2000-2999)
            Error::Unauthorized(_) => 2001,
            Error::MissingClaim(_) => 2002,

            // Provisioning errors (3000-3999)
            Error::Provisioning(_) => 3001,
            Error::ReadinessTimeout { .. } => 3002,

            // Injection errors (4000-4999)
            Error::Injection(_) => 4001,

            // Session and stream errors (5000-5999)
            Error::SessionNotFound(_) => 5001,
            Error::SessionAlreadyExists(_) => 5002,
            Error::SessionAlreadyBound(_) => 5003,
            Error::SessionClosed(_) => 5004,
            Error::AttachTimeout { .. } => 5005,
            Error::Stream(_) => 5006,

            // Infrastructure errors (6000-6999)
            Error::Kube(_) => 6001,

            // General errors (1000-1999)
            Error::InvalidRequest(_) => 1001,
            Error::Internal(_) => 1003,
        }
    }

    /// Get the HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) | Error::MissingClaim(_) => StatusCode::UNAUTHORIZED,

            Error::SessionNotFound(_) => StatusCode::NOT_FOUND,

            Error::SessionAlreadyExists(_) | Error::SessionAlreadyBound(_) => StatusCode::CONFLICT,

            Error::SessionClosed(_) => StatusCode::GONE,

            Error::ReadinessTimeout { .. } | Error::AttachTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }

            Error::Provisioning(_) | Error::Injection(_) | Error::Stream(_) | Error::Kube(_) => {
                StatusCode::BAD_GATEWAY
            }

            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the error ends an exec stream that was already flowing
    pub fn is_stream_failure(&self) -> bool {
        matches!(self, Error::Stream(_) | Error::AttachTimeout { .. })
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Envelope::<()>::failure(self.code(), self.to_string());

        (status, Json(body)).into_response()
    }
}

// Implement From for common error types
impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::Kube(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Internal(format!("failed to render access descriptor: {}", err))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Stream(err.to_string())
    }
}

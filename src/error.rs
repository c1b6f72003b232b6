use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Reasons a proxy descriptor could not be parsed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid proxy format: {0}")]
    InvalidFormat(String),

    #[error("Invalid host or port")]
    InvalidHostOrPort,
}

/// Reasons a transport could not be built for a descriptor
#[derive(Error, Debug)]
pub enum DialError {
    #[error("Invalid host or port")]
    InvalidEndpoint(String),

    #[error("Failed to build transport: {0}")]
    Build(#[from] reqwest::Error),
}

/// Classified cause of a failed probe, listed in classification priority order
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeFailure {
    #[error("Test aborted by user")]
    Aborted,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection timeout")]
    Timeout,

    #[error("Host not found")]
    HostNotFound,

    #[error("SSL/TLS error - try HTTP instead of HTTPS")]
    Tls,

    #[error("Proxy authentication required")]
    ProxyAuthRequired,

    #[error("Forbidden (may require authentication)")]
    Forbidden,

    #[error("Bad Gateway - proxy server error")]
    BadGateway,

    #[error("Service Unavailable - proxy overloaded")]
    ServiceUnavailable,

    #[error("{0}")]
    Other(String),
}

/// Failure to deliver an event to the consumer of a run
#[derive(Error, Debug)]
pub enum EmitError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Output stream closed: {0}")]
    Write(#[from] std::io::Error),
}

/// Application-level error type
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to deliver results: {0}")]
    Delivery(#[from] EmitError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, ProbeError>;

impl ProbeError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProbeError::InvalidRequest(_) | ProbeError::InvalidConfig(_) => {
                StatusCode::BAD_REQUEST
            }
            ProbeError::Delivery(_) | ProbeError::Io(_) | ProbeError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProbeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match &self {
            // Request validation errors carry their message verbatim
            ProbeError::InvalidRequest(msg) => json!({ "error": msg }),
            _ => json!({
                "error": "Internal server error",
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

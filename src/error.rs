use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unified gateway error type.
///
/// Every variant renders as the same structured JSON body that the request
/// gate uses for denied routes, so clients only ever see one error shape.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The path is not exposed to MCP clients.
    #[error("Route {path} is not exposed to MCP")]
    PolicyDenied { path: String },

    /// A component was used before the gateway lifecycle constructed it.
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// JSON error body: `{status, success, error_message, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub status: String,
    pub success: bool,
    pub error_message: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            success: false,
            error_message: message.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PolicyDenied { .. } => StatusCode::FORBIDDEN,
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::PreconditionViolation(_)
            | Self::Config(_)
            | Self::Database(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this error indicates a fault on our side (as opposed to a
    /// client-visible refusal).
    pub fn is_server_fault(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::PreconditionViolation(_) => {
                tracing::error!(error = %self, "Gateway used before it was mounted");
            }
            Self::Upstream(_) => tracing::warn!(error = %self, "Upstream request failed"),
            _ if self.is_server_fault() => tracing::error!(error = %self, "Request failed"),
            _ => {}
        }
        (status, axum::Json(ErrorBody::new(self.to_string()))).into_response()
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(err: rusqlite::Error) -> Self {
        tracing::error!(error = %err, "Database error");
        Self::Database(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Upstream(format!("upstream timed out: {err}"));
        }
        Self::Upstream(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArgument(format!("JSON error: {err}"))
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

//! Error handling for the Iron Dome pipeline
//!
//! Only `Config` is fatal. Every other variant is contained by the worker
//! that produced it and surfaced through counters and component health.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid threshold/interval/path at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Frame source unreadable or a frame failed to load
    #[error("Ingestion error: {0}")]
    Ingestion(String),

    /// Detector call failed or timed out
    #[error("Detection error: {0}")]
    Detection(String),

    /// Write/read failure on the persistence sink
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A single prevention action failed
    #[error("Action error ({action}): {message}")]
    Action { action: String, message: String },

    /// Conflicting lifecycle request (e.g. start while running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLx database error
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error prevents the pipeline from starting
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Ingestion(_) => "INGESTION_ERROR",
            Error::Detection(_) => "DETECTION_ERROR",
            Error::Persistence(_) | Error::Sqlx(_) => "DATABASE_ERROR",
            Error::Action { .. } => "ACTION_ERROR",
            Error::Conflict(_) => "CONFLICT",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Http(_) => "HTTP_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::Http(_) | Error::Detection(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let error_code = self.code();
        let message = self.to_string();

        tracing::error!(
            status = %status,
            error_code = %error_code,
            message = %message,
            "Request error"
        );

        let body = Json(json!({
            "error_code": error_code,
            "message": message
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_config_is_fatal() {
        assert!(Error::Config("threshold".into()).is_fatal());
        assert!(!Error::Detection("timeout".into()).is_fatal());
        assert!(!Error::Persistence("locked".into()).is_fatal());
        assert!(!Error::Action {
            action: "webhook".into(),
            message: "refused".into()
        }
        .is_fatal());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::Ingestion("x".into()).code(), "INGESTION_ERROR");
        assert_eq!(Error::Persistence("x".into()).code(), "DATABASE_ERROR");
        assert_eq!(Error::Conflict("x".into()).code(), "CONFLICT");
    }

    #[test]
    fn test_into_response_status() {
        let response = Error::Conflict("pipeline already running".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = Error::Validation("days must be between 1 and 365".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = Error::Persistence("disk full".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

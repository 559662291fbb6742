/// Unified error types for the GAL resolver
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Main error type for resolution and its surrounding service
#[derive(Error, Debug)]
pub enum ResolverError {
    /// Empty or malformed target identifier / operation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Target absent, or the wrong kind for the requested operation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Identity store cannot be reached
    #[error("Identity store unavailable: {0}")]
    StoreUnavailable(String),

    /// Expansion deadline exceeded
    #[error("Resolution timed out after {0:?}")]
    Timeout(Duration),

    /// Group nesting deeper than the configured bound
    #[error("Group nesting exceeds maximum expansion depth of {max_depth}")]
    DepthExceeded { max_depth: usize },

    /// Database errors outside of lookups (pool setup, migrations)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Short machine-readable code used in error bodies and logs
    pub fn code(&self) -> &'static str {
        match self {
            ResolverError::InvalidInput(_) => "InvalidInput",
            ResolverError::NotFound(_) => "NotFound",
            ResolverError::StoreUnavailable(_) => "StoreUnavailable",
            ResolverError::Timeout(_) => "Timeout",
            ResolverError::DepthExceeded { .. } => "DepthExceeded",
            _ => "InternalServerError",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert ResolverError to HTTP response
impl IntoResponse for ResolverError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ResolverError::InvalidInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ResolverError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ResolverError::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ResolverError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            ResolverError::DepthExceeded { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string())
            }
            ResolverError::Database(_)
            | ResolverError::Config(_)
            | ResolverError::Io(_)
            | ResolverError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: self.code().to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ResolverError::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (ResolverError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                ResolverError::StoreUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ResolverError::Timeout(Duration::from_secs(1)),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                ResolverError::DepthExceeded { max_depth: 4 },
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ResolverError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}

//! Gateway error taxonomy.
//!
//! Three request-level failure classes, mapped to stable machine-readable
//! codes so webhook operators can alert on them. Per-tag purge failures are
//! data in the response body, not request failures.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Stable error codes carried in the response body.
pub mod codes {
    pub const CONFIGURATION: &str = "configuration";
    pub const AUTHENTICATION: &str = "authentication";
    pub const VALIDATION: &str = "validation";
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The server has no secret configured for the requested endpoint.
    #[error("cache gateway secret is not configured")]
    Configuration,
    /// Missing or mismatched secret header.
    #[error("invalid or missing gateway secret")]
    Authentication,
    /// Malformed request body or tags.
    #[error("invalid request: {0}")]
    Validation(String),
}

impl GatewayError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Configuration => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Configuration => codes::CONFIGURATION,
            Self::Authentication => codes::AUTHENTICATION,
            Self::Validation(_) => codes::VALIDATION,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

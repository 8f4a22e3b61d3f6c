//! Centralized error handling with proper HTTP status codes.
//!
//! PayJoin negotiation failures follow the BIP78 wire format
//! (`{errorCode, message}`); everything else uses the internal error shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use treasury_engine::PayjoinError;
use treasury_types::TreasuryError;

/// API Result type
pub type ApiResult<T> = Result<T, ApiError>;

/// API error types with appropriate HTTP status codes
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal server error: {0}")]
    InternalError(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Unsupported protocol version {0}")]
    VersionUnsupported(u32),

    #[error(transparent)]
    Payjoin(#[from] PayjoinError),
}

impl ApiError {
    /// Get the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::VersionUnsupported(_) => StatusCode::BAD_REQUEST,
            // BIP78 protocol failures are client errors; only an internal
            // fault is 5xx.
            ApiError::Payjoin(PayjoinError::Internal(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Payjoin(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Get error type as string
    pub fn error_type(&self) -> &str {
        match self {
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
            ApiError::InternalError(_) => "internal_error",
            ApiError::ServiceUnavailable(_) => "service_unavailable",
            ApiError::VersionUnsupported(_) => "version-unsupported",
            ApiError::Payjoin(e) => e.error_code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();

        let body = match &self {
            // BIP78 wire errors.
            ApiError::Payjoin(e) => Json(json!({
                "errorCode": e.error_code(),
                "message": message,
            })),
            ApiError::VersionUnsupported(_) => Json(json!({
                "errorCode": "version-unsupported",
                "supported": [1],
                "message": message,
            })),
            _ => Json(json!({
                "error": {
                    "type": self.error_type(),
                    "message": message,
                }
            })),
        };

        (status, body).into_response()
    }
}

// Convert internal errors to API errors
impl From<TreasuryError> for ApiError {
    fn from(err: TreasuryError) -> Self {
        match err {
            TreasuryError::NotFound(what) => ApiError::NotFound(what),
            TreasuryError::SigningFailed(msg) => ApiError::BadRequest(msg),
            TreasuryError::InvalidPsbt(msg) => ApiError::BadRequest(msg),
            TreasuryError::Chain(msg) => ApiError::ServiceUnavailable(msg),
            other => ApiError::InternalError(other.to_string()),
        }
    }
}

// Convert anyhow errors to API errors
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

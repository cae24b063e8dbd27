//! Meeting bridge error types.
//!
//! All errors map to HTTP status codes via the `IntoResponse` impl. Messages
//! returned to webhook senders are generic; the underlying cause is logged
//! server-side.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Meeting bridge error type.
///
/// Maps to HTTP status codes:
/// - BadRequest: 400 Bad Request
/// - InvalidSignature: 403 Forbidden
/// - RateLimitExceeded: 429 Too Many Requests
/// - Database, Decryption, InvalidPayload, Internal: 500 Internal Server Error
/// - Downstream: 502 Bad Gateway
/// - QueueFull, ServiceUnavailable: 503 Service Unavailable
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Task queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("Downstream API error: {0}")]
    Downstream(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Returns the HTTP status code for this error (for metrics recording).
    pub fn status_code(&self) -> u16 {
        match self {
            BridgeError::Database(_)
            | BridgeError::Decryption(_)
            | BridgeError::InvalidPayload(_)
            | BridgeError::Internal(_) => 500,
            BridgeError::BadRequest(_) => 400,
            BridgeError::InvalidSignature => 403,
            BridgeError::RateLimitExceeded => 429,
            BridgeError::Downstream(_) => 502,
            BridgeError::QueueFull(_) | BridgeError::ServiceUnavailable(_) => 503,
        }
    }

    /// Short, bounded label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            BridgeError::Database(_) => "database",
            BridgeError::BadRequest(_) => "bad_request",
            BridgeError::InvalidSignature => "invalid_signature",
            BridgeError::RateLimitExceeded => "rate_limited",
            BridgeError::Decryption(_) => "decryption",
            BridgeError::InvalidPayload(_) => "invalid_payload",
            BridgeError::QueueFull(_) => "queue_full",
            BridgeError::Downstream(_) => "downstream",
            BridgeError::ServiceUnavailable(_) => "unavailable",
            BridgeError::Internal(_) => "internal",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            BridgeError::Database(err) => {
                tracing::error!(target: "bridge.store", error = %err, "Database operation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "An internal database error occurred".to_string(),
                )
            }
            BridgeError::BadRequest(reason) => {
                (StatusCode::BAD_REQUEST, "BAD_REQUEST", reason.clone())
            }
            BridgeError::InvalidSignature => (
                StatusCode::FORBIDDEN,
                "INVALID_SIGNATURE",
                "Invalid signature".to_string(),
            ),
            BridgeError::RateLimitExceeded => (
                StatusCode::TOO_MANY_REQUESTS,
                "RATE_LIMIT_EXCEEDED",
                "Too many requests. Please try again later.".to_string(),
            ),
            BridgeError::Decryption(err) => {
                tracing::error!(target: "bridge.webhook", error = %err, "Payload decryption failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DECRYPTION_FAILED",
                    "Event processing failed: payload could not be decrypted".to_string(),
                )
            }
            BridgeError::InvalidPayload(err) => {
                tracing::error!(target: "bridge.webhook", error = %err, "Payload could not be parsed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INVALID_PAYLOAD",
                    "Event processing failed: payload is not a valid event".to_string(),
                )
            }
            BridgeError::QueueFull(pending) => {
                tracing::warn!(target: "bridge.dispatcher", pending = pending, "Task queue full, rejecting event");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "QUEUE_FULL",
                    "Service temporarily unavailable".to_string(),
                )
            }
            BridgeError::Downstream(err) => {
                tracing::error!(target: "bridge.downstream", error = %err, "Downstream call failed");
                (
                    StatusCode::BAD_GATEWAY,
                    "DOWNSTREAM_ERROR",
                    "A downstream service failed".to_string(),
                )
            }
            BridgeError::ServiceUnavailable(reason) => {
                tracing::warn!(target: "bridge.availability", reason = %reason, "Service unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "Service temporarily unavailable".to_string(),
                )
            }
            BridgeError::Internal(err) => {
                tracing::error!(target: "bridge.internal", error = %err, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(error_response)).into_response()
    }
}

/// Convert sqlx errors to BridgeError
impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::Database(err.to_string())
    }
}

/// Convert reqwest errors to BridgeError
impl From<reqwest::Error> for BridgeError {
    fn from(err: reqwest::Error) -> Self {
        BridgeError::Downstream(err.to_string())
    }
}

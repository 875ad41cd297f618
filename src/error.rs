//! # Error Types and Handling
//!
//! Crate-wide error type for the secure request pipeline and its automatic
//! conversion to HTTP responses.
//!
//! ## Error to HTTP Status Mapping
//!
//! | Variant           | HTTP Status             | Notes                         |
//! |-------------------|-------------------------|-------------------------------|
//! | `Rejected`        | 429 Too Many Requests   | admission denied, not retried |
//! | `Unauthenticated` | 401 Unauthorized        | token missing or invalid      |
//! | `EnvelopeInvalid` | 400 Bad Request         | generic body, cause is logged |
//! | `HandlerFailure`  | handler-provided status | business logic error          |
//! | `Transport`       | 500 Internal Error      | redis / network / deadline    |
//! | `Config`          | 500 Internal Error      | startup misconfiguration      |
//! | `Internal`        | 500 Internal Error      | everything else               |
//!
//! `EnvelopeInvalid` deliberately carries no detail. Which of the envelope
//! checks failed (timestamp, replay, signature, decryption) is recorded via
//! `tracing` at the rejection site and never returned on the wire.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Crate-wide error type for pipeline operations.
///
/// Each variant maps to an HTTP status code when converted to an Axum
/// response, so handlers and middleware can return
/// `Result<T, GatekeeperError>` directly.
#[derive(Debug, Clone, Error)]
pub enum GatekeeperError {
    /// Admission denied by the rate limiter. The orchestrator never retries
    /// these; the caller decides whether to back off.
    #[error("too many requests for resource {resource}")]
    Rejected {
        /// The bucket key that ran dry (method name or subject)
        resource: String,
        /// Seconds until one token is expected back, when the backend
        /// can tell
        retry_after: Option<u64>,
    },

    /// Bearer token missing, malformed, signature mismatch, or expired.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Request envelope failed validation. One external reason code for
    /// timestamp, replay, signature, and decryption failures alike.
    #[error("invalid request envelope")]
    EnvelopeInvalid,

    /// Business logic error surfaced by the dispatched handler, with the
    /// handler's own status code.
    #[error("handler failure: {message}")]
    HandlerFailure { status: u16, message: String },

    /// Connection, deadline, or remote-store error. The only category the
    /// client bootstrap layer retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// Configuration is invalid or missing.
    #[error("configuration error: {0}")]
    Config(String),

    /// Unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for GatekeeperError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            GatekeeperError::Rejected { resource, retry_after } => (
                StatusCode::TOO_MANY_REQUESTS,
                serde_json::json!({
                    "error": "too_many_requests",
                    "message": format!("rate limit exceeded for {}", resource),
                    "retry_after_seconds": retry_after,
                }),
            ),
            GatekeeperError::Unauthenticated(msg) => (
                StatusCode::UNAUTHORIZED,
                serde_json::json!({
                    "error": "unauthenticated",
                    "message": msg,
                }),
            ),
            GatekeeperError::EnvelopeInvalid => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({
                    "error": "invalid_envelope",
                    "message": "request envelope rejected",
                }),
            ),
            GatekeeperError::HandlerFailure { status, message } => (
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                serde_json::json!({
                    "error": "handler_failure",
                    "message": message,
                }),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({
                    "error": "internal_error",
                    "message": "an unexpected error occurred",
                }),
            ),
        };

        let mut response = (status, Json(body)).into_response();

        if let GatekeeperError::Rejected {
            retry_after: Some(seconds),
            ..
        } = &self
        {
            if let Ok(value) = seconds.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
        }

        response
    }
}

impl From<redis::RedisError> for GatekeeperError {
    fn from(err: redis::RedisError) -> Self {
        GatekeeperError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for GatekeeperError {
    fn from(err: serde_json::Error) -> Self {
        GatekeeperError::Internal(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatekeeperError>;

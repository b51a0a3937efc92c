//! # Error Handling
//!
//! Two error surfaces live here:
//!
//! - [`AppError`]: errors returned from HTTP handlers before a WebSocket upgrade
//!   happens. They become JSON responses through actix's `ResponseError` trait.
//! - [`RelayError`]: errors raised while a relay session is running. These never
//!   reach an HTTP response; the session coordinator decides whether each one is
//!   transient (logged, session continues) or session-fatal (session drains).
//!
//! ## Error Categories (relay):
//! - **Transient**: `ClientFrame`, `Encoding`, `MalformedEvent`
//! - **Session-fatal**: `Provider`, `PipelineStart`, `Pipeline`, `UpstreamConnect`, `Upstream`
//!
//! Process-fatal problems (missing credential, bad config, bind failure) are
//! plain `anyhow` errors returned from `main` and never take one of these shapes.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors returned from HTTP handlers.
///
/// ## Status Code Mapping:
/// - `BadRequest` → 400 (e.g. an unsupported `format` query parameter)
/// - `Unavailable` → 503 (the concurrent session cap is reached)
#[derive(Debug)]
pub enum AppError {
    /// Client sent a request we cannot serve
    BadRequest(String),

    /// Server is temporarily unable to accept another session
    Unavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts handler errors into JSON responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "bad_request",
///     "message": "unsupported audio format 'midi'",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST, // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE, // 503
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Errors raised inside a relay session.
///
/// ## Rust Concepts:
/// - **Clone + PartialEq**: errors are small values, so tests can compare them
///   directly and the coordinator can keep a copy for its teardown reason
/// - **std::error::Error**: lets these flow into `anyhow` if a caller wants that
#[derive(Debug, Clone, PartialEq)]
pub enum RelayError {
    /// Inbound client frame was not valid structured data or had a bad payload
    ClientFrame(String),

    /// Audio could not be wrapped in the provider envelope (bad size)
    Encoding(String),

    /// Upstream sent something we could not decode
    MalformedEvent(String),

    /// Upstream reported a provider-side fault
    Provider(String),

    /// External decoder process could not be launched
    PipelineStart(String),

    /// External decoder stopped accepting input
    Pipeline(String),

    /// Upstream connection could not be established
    UpstreamConnect(String),

    /// Upstream link failed after it was established
    Upstream(String),
}

impl RelayError {
    /// Whether this error ends the session when it is observed mid-stream.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            RelayError::ClientFrame(_) | RelayError::Encoding(_) | RelayError::MalformedEvent(_)
        )
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::ClientFrame(msg) => write!(f, "Invalid client frame: {}", msg),
            RelayError::Encoding(msg) => write!(f, "Audio encoding error: {}", msg),
            RelayError::MalformedEvent(msg) => write!(f, "Malformed upstream event: {}", msg),
            RelayError::Provider(msg) => write!(f, "Provider error: {}", msg),
            RelayError::PipelineStart(msg) => write!(f, "Failed to start transcoder: {}", msg),
            RelayError::Pipeline(msg) => write!(f, "Transcoder error: {}", msg),
            RelayError::UpstreamConnect(msg) => write!(f, "Upstream connection failed: {}", msg),
            RelayError::Upstream(msg) => write!(f, "Upstream link error: {}", msg),
        }
    }
}

impl std::error::Error for RelayError {}

/// Shorthand for results inside the relay.
pub type RelayResult<T> = Result<T, RelayError>;

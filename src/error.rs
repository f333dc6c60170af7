//! # Error Handling
//!
//! HTTP-facing error type. Domain errors from the registry and the signaling
//! layer are converted into [`AppError`] at the handler boundary, and
//! [`ResponseError`] turns that into a JSON body with a matching status code.
//!
//! Only failures that concern the one request being handled end up here.
//! Teardown problems (a worker that errored, a disconnect that failed) are logged
//! by the registry and never reach a client.
//!
//! ## Key Rust Concepts:
//! - **From trait**: lets handlers use `?` on `RegistryError` / `SignalingError`
//! - **ResponseError trait**: actix-web calls `error_response` for any handler
//!   returning `Err(AppError)`

use crate::connection::SignalingError;
use crate::session::RegistryError;
use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Error categories returned by the HTTP handlers.
///
/// ## Status Code Mapping:
/// - **BadRequest** → 400: the offer could not be parsed
/// - **NotFound** → 404: unknown session id
/// - **Conflict** → 409: a session with that id already exists
/// - **ServiceUnavailable** → 503: at capacity, or shutting down
/// - **Internal** → 500: anything else
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.as_str()),
            AppError::ServiceUnavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", msg.as_str())
            }
            AppError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.as_str())
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// JSON error body:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "session limit of 32 reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        self.parts().0
    }

    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = self.parts();
        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::DuplicateSession(_) => AppError::Conflict(err.to_string()),
            RegistryError::AtCapacity { .. } | RegistryError::ShuttingDown => {
                AppError::ServiceUnavailable(err.to_string())
            }
        }
    }
}

impl From<SignalingError> for AppError {
    fn from(err: SignalingError) -> Self {
        match err {
            SignalingError::UnexpectedType(_) | SignalingError::MalformedSdp(_) => {
                AppError::BadRequest(err.to_string())
            }
            // The client raced a teardown; it should start a fresh session.
            SignalingError::ConnectionClosed(_) => AppError::Conflict(err.to_string()),
            SignalingError::Transport(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", err))
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;

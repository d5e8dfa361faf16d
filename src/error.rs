//! Request-level error surface.
//!
//! Everything that can fail a lookup before the response body is committed is
//! expressed as an [`HttpError`] carrying the status code and message to
//! write back. Per-peer failures inside the discovery engine never reach this
//! type; they are logged and absorbed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// An error that maps directly onto an HTTP response.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HttpError {
    pub status: StatusCode,
    pub message: String,
}

impl HttpError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Malformed request input (bad key encoding, bad Accept header).
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// Empty result on an endpoint that signals absence, or a gated lookup.
    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, "")
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

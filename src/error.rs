//! Error types for mcp-authz

use std::io;

use authz_wire::ErrorBody;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type alias for mcp-authz
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level errors for startup and plumbing.
///
/// Request-path failures use the per-component error enums, which map onto
/// HTTP responses through [`HttpError`].
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A failure that renders as a structured JSON error response.
///
/// `code` is the stable machine-readable identifier; `description` is safe
/// to show to clients and never carries upstream or internal detail.
pub trait HttpError {
    /// HTTP status for this failure
    fn status(&self) -> StatusCode;

    /// Stable machine-readable code
    fn code(&self) -> &'static str;

    /// Client-facing description
    fn description(&self) -> String;

    /// Render as `{error, error_description}` JSON
    fn to_response(&self) -> Response {
        error_response(self.status(), self.code(), &self.description())
    }
}

/// Create a JSON error response.
pub fn error_response(status: StatusCode, error: &str, description: &str) -> Response {
    (status, Json(ErrorBody::new(error, description))).into_response()
}

/// Mark a response as non-cacheable (`Cache-Control: no-store`).
pub fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

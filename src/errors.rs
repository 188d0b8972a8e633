// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Typed error kinds shared across the core and their HTTP mapping

use serde::Serialize;
use warp::http::StatusCode;

/// Errors surfaced by the core API.
///
/// Lookup misses on read paths are expressed as `None`/`false` return values,
/// not errors; these variants cover the cases a caller must distinguish.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Caller-supplied data failed validation
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The referenced id or capability is not known
    #[error("not found: {0}")]
    NotFound(String),

    /// An auth-gated operation was called without a valid token
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Selection produced no server for the capability
    #[error("no candidates available for capability '{0}'")]
    NoCandidates(String),

    /// Invariant violation or unexpected internal state
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status code this error maps to at the transport layer
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) | CoreError::NoCandidates(_) => StatusCode::NOT_FOUND,
            CoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            CoreError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error tag used in HTTP bodies
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::NoCandidates(_) => "no_candidates",
            CoreError::Internal(_) => "internal",
        }
    }
}

/// Wire shape of every error response: `{error, details?}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl From<&CoreError> for ErrorResponse {
    fn from(err: &CoreError) -> Self {
        ErrorResponse {
            error: err.kind().to_string(),
            details: Some(err.to_string()),
        }
    }
}

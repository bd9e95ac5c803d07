//! Service-specific error types

use axum::http::StatusCode;
use thiserror::Error;

/// Inbound request problems caught before the relay runs.
///
/// Failures from the relay itself are `relay::RelayError` and carry their
/// own status mapping.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreflightError {
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("model not supported: {0}")]
    UnknownModel(String),

    #[error("max_tokens {requested} exceeds the limit of {limit} for {model}")]
    MaxTokensTooLarge {
        model: String,
        requested: u32,
        limit: u32,
    },
}

impl PreflightError {
    pub fn status(&self) -> StatusCode {
        StatusCode::BAD_REQUEST
    }

    pub fn error_type(&self) -> &'static str {
        "invalid_request_error"
    }

    pub fn code(&self) -> &'static str {
        match self {
            PreflightError::InvalidBody(_) => "invalid_request_error",
            PreflightError::UnknownModel(_) => "invalid_model",
            PreflightError::MaxTokensTooLarge { .. } => "invalid_max_tokens",
        }
    }
}

//! Relay error taxonomy
//!
//! Each variant maps to one failure class: pool exhaustion, fatal upstream
//! failure, request problems, or caller cancellation.

use upstream::RejectionKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("no credentials available")]
    NoCredentialsAvailable,

    #[error("all credentials exhausted after {attempts} attempts")]
    AllCredentialsExhausted { attempts: usize },

    #[error("upstream rejected the request ({}): {message}", .kind.label())]
    Rejected { kind: RejectionKind, message: String },

    #[error("malformed upstream event: {0}")]
    MalformedEvent(String),

    #[error("upstream returned no content")]
    EmptyResponse,

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("credential reactivation failed: {0}")]
    Reactivation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request cancelled by caller")]
    Cancelled,
}

impl RelayError {
    /// HTTP status the inbound layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::NoCredentialsAvailable | RelayError::AllCredentialsExhausted { .. } => 503,
            RelayError::InvalidRequest(_) => 400,
            // Never rendered: the caller is gone.
            RelayError::Cancelled => 499,
            _ => 502,
        }
    }

    /// Broad error class for the `type` field of an error body.
    pub fn error_type(&self) -> &'static str {
        match self.status_code() {
            503 => "service_unavailable",
            400 => "invalid_request_error",
            _ => "upstream_error",
        }
    }

    /// Specific machine-readable code for the `code` field of an error body.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::NoCredentialsAvailable => "no_credentials_available",
            RelayError::AllCredentialsExhausted { .. } => "all_credentials_exhausted",
            RelayError::Rejected { kind, .. } => match kind {
                RejectionKind::Forbidden => "upstream_forbidden",
                RejectionKind::UpstreamServerError => "upstream_server_error",
                RejectionKind::Unclassified => "upstream_unclassified",
                RejectionKind::UsageLimitExceeded => "upstream_usage_limit",
                RejectionKind::RateLimited => "upstream_rate_limited",
                RejectionKind::NotLoggedIn => "upstream_not_logged_in",
            },
            RelayError::MalformedEvent(_) => "malformed_upstream_event",
            RelayError::EmptyResponse => "empty_upstream_response",
            RelayError::Transport(_) => "upstream_transport_error",
            RelayError::Reactivation(_) => "reactivation_failed",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

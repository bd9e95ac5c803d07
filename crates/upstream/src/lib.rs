//! Upstream contracts for the Kilo gateway
//!
//! Defines the seams between the relay core and the outside world: the raw
//! event shape the transport yields, the rejection taxonomy, and the traits
//! for the transport, reactivation and token-counting collaborators. Also
//! owns the OpenAI-shaped request types, the model registry and the two
//! request-body builders (Claude-shaped and OpenRouter-shaped).
//!
//! The traits use `Pin<Box<dyn Future>>` return types so the relay can hold
//! them as `Arc<dyn Transport>` and swap in scripted fakes under test.

pub mod body;
pub mod claude;
pub mod event;
pub mod models;
pub mod openai;
pub mod openrouter;

pub use body::{BuildError, build_upstream_body, request_headers};
pub use event::{ClaudeEvent, DONE_MARKER, OpenRouterEvent, UpstreamEvent, parse_event};
pub use models::{ModelInfo, ModelSource, find_model, models};
pub use openai::{ChatMessage, ChatRequest};

use futures_util::Stream;
use std::future::Future;
use std::pin::Pin;

/// One item of an upstream response as delivered by the transport.
///
/// `is_terminal` marks a payload after which no further content will follow
/// (e.g. a drained non-2xx error body). `status` is the HTTP status of the
/// response the event belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub text: String,
    pub is_terminal: bool,
    pub status: u16,
}

impl RawEvent {
    /// A regular server-sent-event data payload.
    pub fn data(text: impl Into<String>, status: u16) -> Self {
        Self {
            text: text.into(),
            is_terminal: false,
            status,
        }
    }

    /// A terminal payload, typically an error body returned instead of a stream.
    pub fn terminal(text: impl Into<String>, status: u16) -> Self {
        Self {
            text: text.into(),
            is_terminal: true,
            status,
        }
    }
}

/// Classification of an upstream-signaled failure.
///
/// The upstream reports most credential problems in-band as text rather than
/// through HTTP status codes; only `Forbidden` is derived from the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionKind {
    /// Billing allowance of the credential is used up
    UsageLimitExceeded,
    /// Short-term throttling of the credential
    RateLimited,
    /// The session behind the credential is not authenticated (transient)
    NotLoggedIn,
    /// Generic upstream 5xx condition, not credential-specific
    UpstreamServerError,
    /// HTTP 403: IP or tooling-level block
    Forbidden,
    /// Nothing recognizable; surfaced verbatim, never retried
    Unclassified,
}

impl RejectionKind {
    /// Label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            RejectionKind::UsageLimitExceeded => "usage_limit",
            RejectionKind::RateLimited => "rate_limited",
            RejectionKind::NotLoggedIn => "not_logged_in",
            RejectionKind::UpstreamServerError => "server_error",
            RejectionKind::Forbidden => "forbidden",
            RejectionKind::Unclassified => "unclassified",
        }
    }

    /// Whether the failure is scoped to the credential, so trying another
    /// credential can succeed.
    pub fn is_credential_scoped(&self) -> bool {
        matches!(
            self,
            RejectionKind::UsageLimitExceeded
                | RejectionKind::RateLimited
                | RejectionKind::NotLoggedIn
        )
    }
}

/// Errors from the outbound transport and reactivation collaborators.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("upstream request failed: {0}")]
    Request(String),

    #[error("upstream stream read failed: {0}")]
    Stream(String),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),
}

/// Lazily produced upstream events for one attempt.
///
/// Dropping the stream tears down the underlying connection.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<RawEvent, TransportError>> + Send>>;

/// Everything the transport needs to issue one attempt.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub source: ModelSource,
    pub headers: reqwest::header::HeaderMap,
    pub body: Vec<u8>,
}

/// Outbound transport able to open a server-sent-event channel.
pub trait Transport: Send + Sync {
    /// Issue the request and return its event stream.
    ///
    /// Non-2xx responses are not errors at this level: they arrive as a
    /// single terminal `RawEvent` carrying the body and status.
    fn open<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<EventStream, TransportError>> + Send + 'a>>;
}

/// Result of asking the upstream to restore a billing-exhausted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactivationOutcome {
    /// Credential usable again
    Reactivated,
    /// Recoverable-but-failed: the account has no payment method attached
    PaymentRequired,
    /// Any other answer from the reactivation endpoint
    OtherFailure(String),
}

/// Side-call attempting to restore a billing-exhausted credential.
pub trait Reactivator: Send + Sync {
    fn reactivate<'a>(
        &'a self,
        session_key: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ReactivationOutcome, TransportError>> + Send + 'a>>;
}

/// Token counting for usage accounting.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str, model: &str) -> usize;
}

//! Rejection detection for Kilo upstream payloads
//!
//! The upstream reports credential problems as in-band text (an SSE error
//! event or a JSON error body), rarely through a meaningful status code.
//! Detection is case-insensitive substring matching. Groups are checked in
//! a fixed order and the first group with a hit wins, so a payload that
//! mentions both a usage limit and a rate limit is a usage-limit rejection.

use upstream::RejectionKind;

/// Billing allowance of the cookie is used up.
const USAGE_LIMIT_PATTERNS: &[&str] = &[
    "usage limit",
    "usage_limit",
    "insufficient_quota",
    "insufficient credits",
    "insufficient balance",
    "credit balance is too low",
    "exceeded your current quota",
];

/// Short-term throttling of the cookie.
const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "too many requests",
];

/// Session behind the cookie is not authenticated.
const NOT_LOGGED_IN_PATTERNS: &[&str] = &[
    "not logged in",
    "not_logged_in",
    "unauthorized",
    "unauthenticated",
    "authentication_error",
    "invalid token",
    "invalid api key",
    "invalid x-api-key",
];

/// Generic upstream failure, not tied to the cookie.
const SERVER_ERROR_PATTERNS: &[&str] = &[
    "internal server error",
    "internal_server_error",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "overloaded",
    "api_error",
];

/// Evaluation order; first match wins.
const ORDERED_GROUPS: &[(RejectionKind, &[&str])] = &[
    (RejectionKind::UsageLimitExceeded, USAGE_LIMIT_PATTERNS),
    (RejectionKind::RateLimited, RATE_LIMIT_PATTERNS),
    (RejectionKind::NotLoggedIn, NOT_LOGGED_IN_PATTERNS),
    (RejectionKind::UpstreamServerError, SERVER_ERROR_PATTERNS),
];

/// Classify a raw upstream payload by its text alone.
///
/// Pure and deterministic. Returns `Unclassified` when nothing matches.
pub fn classify(raw: &str) -> RejectionKind {
    let lower = raw.to_lowercase();
    ORDERED_GROUPS
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lower.contains(p)))
        .map(|(kind, _)| *kind)
        .unwrap_or(RejectionKind::Unclassified)
}

/// Classify a terminal payload, taking the HTTP status into account.
///
/// A 403 is `Forbidden` regardless of the body: rotating cookies cannot fix
/// an IP or tooling-level block.
pub fn classify_terminal(status: u16, raw: &str) -> RejectionKind {
    if status == 403 {
        return RejectionKind::Forbidden;
    }
    classify(raw)
}

//! Upstream request assembly: body per protocol family and auth headers.

use crate::claude::to_claude_request;
use crate::models::{ModelInfo, ModelSource};
use crate::openai::ChatRequest;
use crate::openrouter::to_openrouter_request;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};

/// Anthropic API version header value expected by the messages endpoint.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("failed to serialize upstream body: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("session key is not a valid header value")]
    InvalidSessionKey,
}

/// Serialize the protocol-specific body for `request`.
pub fn build_upstream_body(request: &ChatRequest, model: &ModelInfo) -> Result<Vec<u8>, BuildError> {
    let body = match model.source {
        ModelSource::Claude => serde_json::to_vec(&to_claude_request(request, model))?,
        ModelSource::OpenRouter => serde_json::to_vec(&to_openrouter_request(request, model))?,
    };
    Ok(body)
}

/// Headers carrying the session key as a bearer token.
pub fn request_headers(session_key: &str) -> Result<HeaderMap, BuildError> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
    headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));

    let mut auth = HeaderValue::from_str(&format!("Bearer {session_key}"))
        .map_err(|_| BuildError::InvalidSessionKey)?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    Ok(headers)
}

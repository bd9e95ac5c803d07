//! Claude-shaped request body
//!
//! System messages are lifted into the top-level `system` array with
//! ephemeral cache control. OpenAI `image_url` parts become Claude image
//! blocks: `data:` URLs are unpacked into base64 sources, anything else is
//! passed through as a URL source.

use crate::models::ModelInfo;
use crate::openai::{ChatMessage, ChatRequest};
use serde::Serialize;
use serde_json::{Value, json};

#[derive(Debug, Serialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub system: Vec<SystemBlock>,
    pub messages: Vec<ClaudeMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
    pub cache_control: CacheControl,
}

#[derive(Debug, Serialize)]
pub struct CacheControl {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Serialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

/// Build the Claude request for `request`, already validated against `model`.
pub fn to_claude_request(request: &ChatRequest, model: &ModelInfo) -> ClaudeRequest {
    let system = request
        .messages
        .iter()
        .filter(|m| m.is_system())
        .map(|m| SystemBlock {
            kind: "text",
            text: m.text(),
            cache_control: CacheControl { kind: "ephemeral" },
        })
        .collect();

    let messages = request
        .messages
        .iter()
        .filter(|m| !m.is_system())
        .map(convert_message)
        .collect();

    // Extended thinking requires temperature 1 and a budget below max_tokens.
    let (temperature, thinking) = if model.thinking {
        (
            Some(1.0),
            Some(ThinkingConfig {
                kind: "enabled",
                budget_tokens: request.max_tokens.saturating_sub(1),
            }),
        )
    } else {
        (request.temperature, None)
    };

    ClaudeRequest {
        model: model.upstream_model.to_string(),
        max_tokens: request.max_tokens,
        temperature,
        system,
        messages,
        stream: true,
        thinking,
    }
}

fn convert_message(message: &ChatMessage) -> ClaudeMessage {
    let content = match &message.content {
        Value::String(s) => Value::String(s.clone()),
        Value::Array(parts) => Value::Array(parts.iter().map(convert_part).collect()),
        Value::Object(_) => Value::Array(vec![convert_part(&message.content)]),
        other => Value::String(other.to_string()),
    };
    ClaudeMessage {
        role: message.role.clone(),
        content,
    }
}

fn convert_part(part: &Value) -> Value {
    let Some(obj) = part.as_object() else {
        return match part {
            Value::String(s) => json!({"type": "text", "text": s}),
            other => json!({"type": "text", "text": other.to_string()}),
        };
    };
    match obj.get("type").and_then(Value::as_str) {
        Some("image_url") => {
            let url = obj
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            image_block(url)
        }
        // Already Claude-shaped (text, image, tool blocks): pass through.
        Some(_) => part.clone(),
        None => json!({"type": "text", "text": part.to_string()}),
    }
}

fn image_block(url: &str) -> Value {
    if let Some((media_type, data)) = split_data_url(url) {
        return json!({
            "type": "image",
            "source": {"type": "base64", "media_type": media_type, "data": data}
        });
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

/// Split `data:image/png;base64,AAAA` into (`image/png`, `AAAA`).
fn split_data_url(url: &str) -> Option<(&str, &str)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.split(';').next()?;
    if !media_type.starts_with("image/") {
        return None;
    }
    Some((media_type, data))
}

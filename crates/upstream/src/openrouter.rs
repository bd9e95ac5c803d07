//! OpenRouter-shaped request body
//!
//! System messages collapse into a single `system` string. Every other
//! message is normalized to an array of content parts, and the stream is
//! asked to report usage in a trailing chunk.

use crate::models::ModelInfo;
use crate::openai::{ChatMessage, ChatRequest};
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct OpenRouterRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<OpenRouterMessage>,
    pub stream: bool,
    pub stream_options: StreamOptions,
    pub transforms: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct OpenRouterMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

pub fn to_openrouter_request(request: &ChatRequest, model: &ModelInfo) -> OpenRouterRequest {
    let system_parts: Vec<String> = request
        .messages
        .iter()
        .filter(|m| m.is_system())
        .map(ChatMessage::text)
        .filter(|t| !t.is_empty())
        .collect();
    let system = (!system_parts.is_empty()).then(|| system_parts.join("\n\n"));

    let messages = request
        .messages
        .iter()
        .filter(|m| !m.is_system())
        .map(|m| OpenRouterMessage {
            role: m.role.clone(),
            content: content_parts(&m.content),
        })
        .collect();

    OpenRouterRequest {
        model: model.upstream_model.to_string(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        system,
        messages,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        transforms: vec!["middle-out"],
    }
}

fn content_parts(content: &Value) -> Vec<ContentPart> {
    match content {
        Value::String(s) => vec![ContentPart::Text { text: s.clone() }],
        Value::Array(items) => items.iter().filter_map(part).collect(),
        Value::Null => Vec::new(),
        other => part(other).into_iter().collect(),
    }
}

fn part(item: &Value) -> Option<ContentPart> {
    match item {
        Value::String(s) => Some(ContentPart::Text { text: s.clone() }),
        Value::Object(obj) => match obj.get("type").and_then(Value::as_str) {
            Some("text") => obj.get("text").and_then(Value::as_str).map(|t| ContentPart::Text {
                text: t.to_string(),
            }),
            Some("image_url") => obj
                .get("image_url")
                .and_then(|i| i.get("url"))
                .and_then(Value::as_str)
                .map(|url| ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: url.to_string(),
                    },
                }),
            _ => {
                tracing::debug!(part = %item, "dropping unsupported content part");
                None
            }
        },
        other => Some(ContentPart::Text {
            text: other.to_string(),
        }),
    }
}

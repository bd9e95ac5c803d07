//! OpenAI chat-completion request types
//!
//! Message `content` is kept as raw JSON: clients send either a string or an
//! array of typed parts, and both body builders need to see the original shape.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stream: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

/// Clients send `"max_tokens": null` to mean "not set".
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Value,
}

impl ChatMessage {
    pub fn is_system(&self) -> bool {
        self.role == "system"
    }

    /// True when the message carries nothing worth sending upstream.
    pub fn is_empty(&self) -> bool {
        match &self.content {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            Value::Array(parts) => parts.is_empty(),
            _ => false,
        }
    }

    /// Flatten the content to plain text, joining text parts.
    ///
    /// Non-text parts (images) are skipped. Unknown shapes fall back to their
    /// JSON rendering so nothing silently disappears.
    pub fn text(&self) -> String {
        match &self.content {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(obj) => obj.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }
}

impl ChatRequest {
    /// Drop messages with empty content. Clients such as IDE plugins
    /// routinely send blank assistant turns that the upstream rejects.
    pub fn remove_empty_messages(&mut self) {
        self.messages.retain(|m| !m.is_empty());
    }

    /// Insert operator-configured messages right after the last system
    /// message, or at the front when there is none.
    pub fn insert_pre_messages(&mut self, pre_messages: Vec<ChatMessage>) {
        if pre_messages.is_empty() {
            return;
        }
        let at = self
            .messages
            .iter()
            .rposition(ChatMessage::is_system)
            .map(|i| i + 1)
            .unwrap_or(0);
        self.messages.splice(at..at, pre_messages);
    }
}

/// Parse a JSON array of chat messages, as configured for pre-messages.
pub fn parse_pre_messages(json: &str) -> Result<Vec<ChatMessage>, serde_json::Error> {
    serde_json::from_str(json)
}

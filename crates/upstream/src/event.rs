//! Typed views of upstream stream events
//!
//! Parsing is protocol-specific: a Claude event must carry `type`, an
//! OpenRouter chunk is read for its first choice, its usage and any inline
//! error object. Unknown fields are ignored.

use crate::models::ModelSource;
use serde::Deserialize;
use serde_json::Value;

/// Sentinel payload ending an OpenAI-style stream.
pub const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    Done,
    Claude(ClaudeEvent),
    OpenRouter(OpenRouterEvent),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaudeEvent {
    /// `content_block_delta` (or any event with a content delta)
    Delta {
        thinking: Option<String>,
        text: Option<String>,
    },
    /// `message_delta` carrying the stop reason
    MessageDelta { stop_reason: Option<String> },
    MessageStop,
    /// In-stream `error` event; holds the raw payload for classification
    Error(String),
    /// `message_start`, `ping`, block start/stop and anything else without content
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenRouterEvent {
    Choice {
        content: Option<String>,
        finish_reason: Option<String>,
    },
    /// Trailing chunk with usage and no choices
    UsageOnly,
    /// Inline `{"error": ...}` chunk; holds the raw payload
    Error(String),
    /// Neither choices nor usage
    Empty,
}

#[derive(Debug, Deserialize)]
struct ClaudeWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<ClaudeDeltaWire>,
}

#[derive(Debug, Deserialize)]
struct ClaudeDeltaWire {
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterWire {
    #[serde(default)]
    choices: Option<Vec<ChoiceWire>>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChoiceWire {
    #[serde(default)]
    delta: Option<ChoiceDeltaWire>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChoiceDeltaWire {
    #[serde(default)]
    content: Option<String>,
}

/// Strip an optional `data:` prefix and surrounding whitespace.
pub fn payload(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed
        .strip_prefix("data:")
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

/// Parse one event payload for the given protocol family.
pub fn parse_event(source: ModelSource, text: &str) -> Result<UpstreamEvent, serde_json::Error> {
    let data = payload(text);
    if data == DONE_MARKER {
        return Ok(UpstreamEvent::Done);
    }
    match source {
        ModelSource::Claude => parse_claude(data).map(UpstreamEvent::Claude),
        ModelSource::OpenRouter => parse_openrouter(data).map(UpstreamEvent::OpenRouter),
    }
}

fn parse_claude(data: &str) -> Result<ClaudeEvent, serde_json::Error> {
    let wire: ClaudeWire = serde_json::from_str(data)?;
    let event = match (wire.kind.as_str(), wire.delta) {
        ("error", _) => ClaudeEvent::Error(data.to_string()),
        ("message_stop", _) => ClaudeEvent::MessageStop,
        ("message_delta", Some(delta)) => ClaudeEvent::MessageDelta {
            stop_reason: delta.stop_reason,
        },
        (_, Some(delta)) if delta.thinking.is_some() || delta.text.is_some() => {
            ClaudeEvent::Delta {
                thinking: delta.thinking,
                text: delta.text,
            }
        }
        _ => ClaudeEvent::Other,
    };
    Ok(event)
}

fn parse_openrouter(data: &str) -> Result<OpenRouterEvent, serde_json::Error> {
    let wire: OpenRouterWire = serde_json::from_str(data)?;
    if wire.error.is_some() {
        return Ok(OpenRouterEvent::Error(data.to_string()));
    }
    let Some(choice) = wire.choices.into_iter().flatten().next() else {
        return Ok(if wire.usage.is_some() {
            OpenRouterEvent::UsageOnly
        } else {
            OpenRouterEvent::Empty
        });
    };
    Ok(OpenRouterEvent::Choice {
        content: choice.delta.and_then(|d| d.content),
        finish_reason: choice.finish_reason.filter(|r| !r.is_empty()),
    })
}

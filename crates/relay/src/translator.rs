//! Per-attempt stream translation
//!
//! Feeds one upstream event at a time through the typed parser for the
//! model's protocol family and returns the content to forward plus, at most
//! once, the attempt's terminal signal.
//!
//! Claude streams never mark where reasoning ends; the boundary is inferred
//! from the first text delta that follows thinking deltas:
//!
//! ```text
//! thinking("a") → "<think>\n\na"
//! thinking("b") → "b"
//! text("c")     → "</think>\n\nc"
//! text("d")     → "d"
//! ```

use cookie_pool::classify_terminal;
use tracing::debug;
use upstream::{
    ClaudeEvent, ModelSource, OpenRouterEvent, RawEvent, RejectionKind, UpstreamEvent, parse_event,
};

use crate::error::{RelayError, Result};

const THINK_OPEN: &str = "<think>\n\n";
const THINK_CLOSE: &str = "</think>\n\n";

/// Terminal outcome of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Message completed normally with this finish reason
    Success(String),
    /// No further content will follow; the caller decides what it means
    EndOfStream,
    /// Upstream refused the attempt; `payload` is the raw refusal text
    Rejected { kind: RejectionKind, payload: String },
}

/// Result of feeding one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Translated {
    pub content: Option<String>,
    pub signal: Option<Signal>,
}

impl Translated {
    fn content(text: String) -> Self {
        Self {
            content: (!text.is_empty()).then_some(text),
            signal: None,
        }
    }

    fn signal(signal: Signal) -> Self {
        Self {
            content: None,
            signal: Some(signal),
        }
    }

    fn rejected(kind: RejectionKind, payload: &str) -> Self {
        Self::signal(Signal::Rejected {
            kind,
            payload: payload.to_string(),
        })
    }
}

/// Reasoning-phase flags for one attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ThinkingPhase {
    open: bool,
    closed: bool,
}

impl ThinkingPhase {
    fn thinking(&mut self, text: &str) -> String {
        if self.open {
            return text.to_string();
        }
        self.open = true;
        self.closed = false;
        format!("{THINK_OPEN}{text}")
    }

    fn answer(&mut self, text: &str) -> String {
        if self.open && !self.closed {
            self.open = false;
            self.closed = true;
            return format!("{THINK_CLOSE}{text}");
        }
        text.to_string()
    }
}

/// Translator state for one attempt. Never reused across attempts.
#[derive(Debug)]
pub struct StreamTranslator {
    source: ModelSource,
    phase: ThinkingPhase,
    stop_reason: Option<String>,
}

impl StreamTranslator {
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            phase: ThinkingPhase::default(),
            stop_reason: None,
        }
    }

    /// Translate one raw event.
    ///
    /// Malformed JSON in a regular event is a hard error. A terminal payload
    /// is read as an ordinary event first and classified only when it yields
    /// neither content nor a signal. A 403 is forbidden whatever the body.
    pub fn feed(&mut self, raw: &RawEvent) -> Result<Translated> {
        if raw.is_terminal {
            return Ok(self.terminal(raw));
        }
        let event = parse_event(self.source, &raw.text).map_err(|e| {
            RelayError::MalformedEvent(format!("{e}: {}", truncate(&raw.text, 200)))
        })?;
        Ok(self.event(event, raw.status))
    }

    fn terminal(&mut self, raw: &RawEvent) -> Translated {
        if raw.status == 403 {
            return Translated::rejected(RejectionKind::Forbidden, &raw.text);
        }
        if let Ok(event) = parse_event(self.source, &raw.text) {
            let mut translated = self.event(event, raw.status);
            if translated.signal.is_some() {
                return translated;
            }
            // Nothing follows a terminal payload.
            if translated.content.is_some() {
                translated.signal = Some(Signal::EndOfStream);
                return translated;
            }
        }
        Translated::rejected(classify_terminal(raw.status, &raw.text), &raw.text)
    }

    fn event(&mut self, event: UpstreamEvent, status: u16) -> Translated {
        match event {
            UpstreamEvent::Done => Translated::signal(Signal::EndOfStream),
            UpstreamEvent::Claude(event) => self.claude(event, status),
            UpstreamEvent::OpenRouter(event) => self.openrouter(event, status),
        }
    }

    fn claude(&mut self, event: ClaudeEvent, status: u16) -> Translated {
        match event {
            ClaudeEvent::Delta { thinking, text } => {
                let mut out = String::new();
                if let Some(t) = thinking.filter(|t| !t.is_empty()) {
                    out.push_str(&self.phase.thinking(&t));
                }
                if let Some(t) = text.filter(|t| !t.is_empty()) {
                    out.push_str(&self.phase.answer(&t));
                }
                Translated::content(out)
            }
            ClaudeEvent::MessageDelta { stop_reason } => {
                if let Some(reason) = stop_reason {
                    self.stop_reason = Some(finish_reason(&reason).to_string());
                }
                Translated::default()
            }
            ClaudeEvent::MessageStop => {
                let reason = self.stop_reason.take().unwrap_or_else(|| "stop".into());
                Translated::signal(Signal::Success(reason))
            }
            ClaudeEvent::Error(payload) => {
                Translated::rejected(classify_terminal(status, &payload), &payload)
            }
            ClaudeEvent::Other => Translated::default(),
        }
    }

    fn openrouter(&mut self, event: OpenRouterEvent, status: u16) -> Translated {
        match event {
            OpenRouterEvent::Choice {
                content,
                finish_reason,
            } => Translated {
                content: content.filter(|c| !c.is_empty()),
                signal: finish_reason.map(Signal::Success),
            },
            OpenRouterEvent::UsageOnly => Translated::signal(Signal::EndOfStream),
            OpenRouterEvent::Error(payload) => {
                Translated::rejected(classify_terminal(status, &payload), &payload)
            }
            OpenRouterEvent::Empty => {
                debug!("ignoring chunk without choices or usage");
                Translated::default()
            }
        }
    }
}

/// Map a Claude stop reason onto the OpenAI finish reason vocabulary.
fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((i, _)) => &text[..i],
        None => text,
    }
}

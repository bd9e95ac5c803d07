//! Canonical output of the relay

use serde::Serialize;

use crate::error::RelayError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One unit of the streaming output.
///
/// A stream is `Content*` followed by exactly one `Finish` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaEvent {
    Content(String),
    Finish { reason: String, usage: Usage },
    Error(RelayError),
}

impl DeltaEvent {
    #[cfg(test)]
    pub(crate) fn is_terminal(&self) -> bool {
        !matches!(self, DeltaEvent::Content(_))
    }
}

/// Buffered result of a successful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    pub finish_reason: String,
    pub usage: Usage,
}

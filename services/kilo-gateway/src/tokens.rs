//! BPE token counting for usage accounting

use tiktoken_rs::CoreBPE;
use upstream::TokenCounter;

/// Counts tokens with the `cl100k_base` encoding regardless of model.
///
/// The upstream does not report usage for every protocol, so both prompt
/// and completion counts are estimated locally with one shared encoding.
pub struct TiktokenCounter {
    bpe: &'static CoreBPE,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base_singleton(),
        }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str, _model: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_has_no_tokens() {
        assert_eq!(TiktokenCounter::new().count("", "claude-sonnet-4-20250514"), 0);
    }

    #[test]
    fn counts_grow_with_text() {
        let counter = TiktokenCounter::new();
        let short = counter.count("hello", "m");
        let long = counter.count("hello there, how are you doing today?", "m");
        assert!(short >= 1);
        assert!(long > short);
    }

    #[test]
    fn model_does_not_change_count() {
        let counter = TiktokenCounter::new();
        assert_eq!(
            counter.count("same text", "claude-opus-4-20250514"),
            counter.count("same text", "openai/gpt-4.1")
        );
    }
}

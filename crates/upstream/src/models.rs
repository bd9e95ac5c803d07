//! Supported model registry
//!
//! Maps the client-facing model id to the upstream protocol family, the
//! upstream model name and the per-model completion-token ceiling.

use serde::Serialize;

/// Upstream protocol family for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Anthropic-shaped messages endpoint and event stream
    Claude,
    /// OpenRouter-shaped (OpenAI-compatible) chat completions
    OpenRouter,
}

impl ModelSource {
    /// Path appended to the upstream base URL.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            ModelSource::Claude => "/api/claude/v1/messages",
            ModelSource::OpenRouter => "/api/openrouter/chat/completions",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ModelSource::Claude => "claude",
            ModelSource::OpenRouter => "openrouter",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Id clients send in `model`
    pub id: &'static str,
    /// Model name sent upstream
    pub upstream_model: &'static str,
    /// Upper bound accepted for `max_tokens`
    pub max_tokens: u32,
    pub source: ModelSource,
    /// Extended thinking is enabled for this id
    pub thinking: bool,
}

const REGISTRY: &[ModelInfo] = &[
    ModelInfo {
        id: "claude-3-7-sonnet-20250219",
        upstream_model: "claude-3-7-sonnet-20250219",
        max_tokens: 64_000,
        source: ModelSource::Claude,
        thinking: false,
    },
    ModelInfo {
        id: "claude-3-7-sonnet-20250219-thinking",
        upstream_model: "claude-3-7-sonnet-20250219",
        max_tokens: 64_000,
        source: ModelSource::Claude,
        thinking: true,
    },
    ModelInfo {
        id: "claude-sonnet-4-20250514",
        upstream_model: "claude-sonnet-4-20250514",
        max_tokens: 64_000,
        source: ModelSource::Claude,
        thinking: false,
    },
    ModelInfo {
        id: "claude-sonnet-4-20250514-thinking",
        upstream_model: "claude-sonnet-4-20250514",
        max_tokens: 64_000,
        source: ModelSource::Claude,
        thinking: true,
    },
    ModelInfo {
        id: "claude-opus-4-20250514",
        upstream_model: "claude-opus-4-20250514",
        max_tokens: 32_000,
        source: ModelSource::Claude,
        thinking: false,
    },
    ModelInfo {
        id: "claude-opus-4-20250514-thinking",
        upstream_model: "claude-opus-4-20250514",
        max_tokens: 32_000,
        source: ModelSource::Claude,
        thinking: true,
    },
    ModelInfo {
        id: "google/gemini-2.5-pro-preview",
        upstream_model: "google/gemini-2.5-pro-preview",
        max_tokens: 65_536,
        source: ModelSource::OpenRouter,
        thinking: false,
    },
    ModelInfo {
        id: "google/gemini-2.5-flash-preview",
        upstream_model: "google/gemini-2.5-flash-preview",
        max_tokens: 65_536,
        source: ModelSource::OpenRouter,
        thinking: false,
    },
    ModelInfo {
        id: "openai/gpt-4.1",
        upstream_model: "openai/gpt-4.1",
        max_tokens: 32_768,
        source: ModelSource::OpenRouter,
        thinking: false,
    },
];

/// Look up a client-facing model id.
pub fn find_model(id: &str) -> Option<&'static ModelInfo> {
    REGISTRY.iter().find(|m| m.id == id)
}

/// All registered models, in listing order.
pub fn models() -> &'static [ModelInfo] {
    REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_variant_maps_to_base_upstream_model() {
        let model = find_model("claude-3-7-sonnet-20250219-thinking").unwrap();
        assert_eq!(model.upstream_model, "claude-3-7-sonnet-20250219");
        assert!(model.thinking);
        assert_eq!(model.source, ModelSource::Claude);
    }

    #[test]
    fn unknown_model_is_none() {
        assert!(find_model("gpt-2").is_none());
    }

    #[test]
    fn ids_are_unique() {
        let mut ids: Vec<_> = models().iter().map(|m| m.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), models().len());
    }

    #[test]
    fn endpoint_paths_differ_per_source() {
        assert_eq!(ModelSource::Claude.endpoint_path(), "/api/claude/v1/messages");
        assert_eq!(
            ModelSource::OpenRouter.endpoint_path(),
            "/api/openrouter/chat/completions"
        );
    }
}

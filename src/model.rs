//! Model Spec & Config (C1): immutable per-model capability descriptors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{ModelConfigEntry, PenguinConfig};
use crate::error::{PenguinError, Result};

/// Which wire-level client talks to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientPreference {
    Native,
    Openrouter,
    Litellm,
}

/// How the model expresses extended "thinking"/reasoning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum ReasoningStyle {
    Effort { effort: ReasoningEffort },
    MaxTokens { reasoning_max_tokens: u32 },
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

const DEFAULT_SAFETY_FRACTION: f64 = 0.85;
const MIN_SAFETY_FRACTION: f64 = 0.5;
const MAX_SAFETY_FRACTION: f64 = 0.95;

/// Immutable per-model capability descriptor. Produced once by
/// [`ModelRegistry::resolve`] and shared (cheaply cloned) from there on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub model_id: String,
    pub provider: String,
    pub client_preference: ClientPreference,

    pub max_context_window_tokens: u32,
    pub max_output_tokens: u32,
    pub max_history_tokens: u32,

    pub supports_streaming: bool,
    pub supports_vision: bool,
    pub supports_tool_calls: bool,
    pub supports_reasoning: bool,

    pub reasoning_style: ReasoningStyle,

    pub api_base: Option<String>,
    pub api_key_env: Option<String>,
}

impl ModelSpec {
    fn new(
        model_id: String,
        provider: String,
        client_preference: ClientPreference,
        max_context_window_tokens: u32,
        max_output_tokens: u32,
        safety_fraction: f64,
        supports_streaming: bool,
        supports_vision: bool,
        supports_tool_calls: bool,
        reasoning_style: ReasoningStyle,
        api_base: Option<String>,
        api_key_env: Option<String>,
    ) -> Self {
        let clamped = safety_fraction.clamp(MIN_SAFETY_FRACTION, MAX_SAFETY_FRACTION);
        let max_history_tokens =
            (max_context_window_tokens as f64 * clamped).floor() as u32;
        let supports_reasoning = !matches!(reasoning_style, ReasoningStyle::None);

        Self {
            model_id,
            provider,
            client_preference,
            max_context_window_tokens,
            max_output_tokens,
            max_history_tokens,
            supports_streaming,
            supports_vision,
            supports_tool_calls,
            supports_reasoning,
            reasoning_style,
            api_base,
            api_key_env,
        }
    }

    /// Invariant: `max_history_tokens <= max_context_window_tokens`.
    pub fn is_valid(&self) -> bool {
        self.max_history_tokens <= self.max_context_window_tokens
    }
}

/// Family-string heuristics for reasoning-style auto-detection, used only
/// when config is silent on the point (explicit config always wins).
fn detect_reasoning_style(model_id: &str) -> ReasoningStyle {
    let lower = model_id.to_lowercase();
    if lower.contains("o1") || lower.contains("o3") || lower.contains("gpt-5") {
        ReasoningStyle::Effort {
            effort: ReasoningEffort::Medium,
        }
    } else if lower.contains("claude") && (lower.contains("sonnet") || lower.contains("opus")) {
        ReasoningStyle::MaxTokens {
            reasoning_max_tokens: 4096,
        }
    } else {
        ReasoningStyle::None
    }
}

fn detect_client_preference(provider: &str) -> ClientPreference {
    match provider {
        "anthropic" | "openai" => ClientPreference::Native,
        "openrouter" => ClientPreference::Openrouter,
        _ => ClientPreference::Litellm,
    }
}

/// Resolves and caches [`ModelSpec`]s from a merged [`PenguinConfig`] (C1).
///
/// One instance lives on the `Core` (no process-global cache, per the
/// "no hidden module-level mutable state" design note).
pub struct ModelRegistry {
    config: PenguinConfig,
    cache: dashmap::DashMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(config: PenguinConfig) -> Self {
        Self {
            config,
            cache: dashmap::DashMap::new(),
        }
    }

    /// Pure (modulo caching) resolution of a model id to its [`ModelSpec`].
    /// Fails with `ConfigError` if the id is unknown and not the default.
    pub fn resolve(&self, model_id: &str) -> Result<ModelSpec> {
        if let Some(spec) = self.cache.get(model_id) {
            return Ok(spec.clone());
        }

        let entry = self
            .config
            .model_configs
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| default_entry_for(model_id));

        let provider = entry
            .provider
            .clone()
            .unwrap_or_else(|| infer_provider(model_id));
        let client_preference = entry
            .client_preference
            .unwrap_or_else(|| detect_client_preference(&provider));
        let reasoning_style = entry
            .reasoning
            .clone()
            .map(|r| r.into_style())
            .unwrap_or_else(|| detect_reasoning_style(model_id));

        let spec = ModelSpec::new(
            model_id.to_string(),
            provider,
            client_preference,
            entry.max_context_window_tokens.unwrap_or(200_000),
            entry.max_output_tokens.unwrap_or(8_192),
            entry.safety_fraction.unwrap_or(DEFAULT_SAFETY_FRACTION),
            entry.streaming_enabled.unwrap_or(true),
            entry.vision_enabled.unwrap_or(false),
            true,
            reasoning_style,
            entry.api_base.clone(),
            entry.api_key_env.clone(),
        );

        if !spec.is_valid() {
            return Err(PenguinError::Config(format!(
                "model '{model_id}': max_history_tokens exceeds max_context_window_tokens"
            )));
        }

        self.cache.insert(model_id.to_string(), spec.clone());
        Ok(spec)
    }

    pub fn known_models(&self) -> Vec<String> {
        self.config.model_configs.keys().cloned().collect()
    }
}

fn default_entry_for(model_id: &str) -> ModelConfigEntry {
    ModelConfigEntry {
        provider: Some(infer_provider(model_id)),
        ..Default::default()
    }
}

fn infer_provider(model_id: &str) -> String {
    let lower = model_id.to_lowercase();
    if lower.contains("claude") {
        "anthropic".to_string()
    } else if lower.contains("gpt") || lower.starts_with("o1") || lower.starts_with("o3") {
        "openai".to_string()
    } else if let Some((prefix, _)) = model_id.split_once('/') {
        prefix.to_string()
    } else {
        "unknown".to_string()
    }
}

pub fn empty_model_configs() -> HashMap<String, ModelConfigEntry> {
    HashMap::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PenguinConfig;

    #[test]
    fn safety_fraction_clamped_and_history_bounded() {
        let spec = ModelSpec::new(
            "anthropic/claude-x".into(),
            "anthropic".into(),
            ClientPreference::Native,
            100_000,
            4096,
            1.5, // out of range, should clamp to 0.95
            true,
            false,
            true,
            ReasoningStyle::None,
            None,
            None,
        );
        assert_eq!(spec.max_history_tokens, 95_000);
        assert!(spec.is_valid());
    }

    #[test]
    fn resolve_unknown_model_falls_back_to_defaults() {
        let registry = ModelRegistry::new(PenguinConfig::default());
        let spec = registry.resolve("anthropic/claude-sonnet-4").unwrap();
        assert_eq!(spec.provider, "anthropic");
        assert_eq!(spec.client_preference, ClientPreference::Native);
        assert!(matches!(spec.reasoning_style, ReasoningStyle::MaxTokens { .. }));
    }

    #[test]
    fn resolve_is_cached() {
        let registry = ModelRegistry::new(PenguinConfig::default());
        let a = registry.resolve("openai/o3-mini").unwrap();
        let b = registry.resolve("openai/o3-mini").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn explicit_config_overrides_auto_detection() {
        let mut config = PenguinConfig::default();
        config.model_configs.insert(
            "custom/model".into(),
            ModelConfigEntry {
                provider: Some("custom-provider".into()),
                client_preference: Some(ClientPreference::Litellm),
                reasoning: None,
                ..Default::default()
            },
        );
        let registry = ModelRegistry::new(config);
        let spec = registry.resolve("custom/model").unwrap();
        assert_eq!(spec.provider, "custom-provider");
        assert_eq!(spec.client_preference, ClientPreference::Litellm);
    }
}

//! Layered configuration (§6.1, §10.3): package defaults → project defaults
//! → user config → project-local config → project-local overrides → env.
//! Built on the `config` crate so each layer can be merged rather than
//! replaced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PenguinError, Result};
use crate::model::{ClientPreference, ReasoningEffort, ReasoningStyle};

const PACKAGE_DEFAULTS: &str = include_str!("default.toml");

/// Per-model override entry, keyed by model id under `model_configs.<id>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfigEntry {
    pub provider: Option<String>,
    pub client_preference: Option<ClientPreference>,
    pub api_base: Option<String>,
    pub api_key_env: Option<String>,
    pub max_context_window_tokens: Option<u32>,
    pub max_output_tokens: Option<u32>,
    pub safety_fraction: Option<f64>,
    pub temperature: Option<f32>,
    pub streaming_enabled: Option<bool>,
    pub vision_enabled: Option<bool>,
    pub reasoning: Option<ReasoningConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    pub enabled: bool,
    pub effort: Option<ReasoningEffort>,
    pub max_tokens: Option<u32>,
    pub exclude: bool,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            effort: None,
            max_tokens: None,
            exclude: false,
        }
    }
}

impl ReasoningConfig {
    pub fn into_style(self) -> ReasoningStyle {
        if !self.enabled {
            return ReasoningStyle::None;
        }
        match (self.effort, self.max_tokens) {
            (Some(effort), _) => ReasoningStyle::Effort { effort },
            (None, Some(reasoning_max_tokens)) => ReasoningStyle::MaxTokens { reasoning_max_tokens },
            (None, None) => ReasoningStyle::None,
        }
    }
}

/// A persona / agent definition under `agents.<name>` (§4.11, §6.1).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub model_id: Option<String>,
    pub default_tools: Vec<String>,
    pub share_session_with: Option<String>,
    pub share_context_window_with: Option<String>,
    pub shared_cw_max_tokens: Option<u32>,
    pub model_max_tokens: Option<u32>,
    pub activate: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub default: Option<String>,
    pub provider: Option<String>,
    pub client_preference: Option<ClientPreference>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSection {
    pub scratchpad_dir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub additional_directories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceSection {
    pub path: Option<String>,
    pub create_dirs: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsSection {
    pub enabled: bool,
    pub log_to_file: bool,
    pub log_path: Option<String>,
    pub max_context_tokens: Option<u32>,
}

impl Default for DiagnosticsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            log_to_file: false,
            log_path: None,
            max_context_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSection {
    pub fast_startup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSection {
    pub prompt_style: Option<String>,
    pub show_tool_results: bool,
}

/// The fully merged configuration tree (§6.1). Unknown keys are ignored
/// (every section derives with `#[serde(default)]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PenguinConfig {
    pub model: ModelSection,
    pub model_configs: HashMap<String, ModelConfigEntry>,
    pub agents: HashMap<String, PersonaConfig>,
    pub context: ContextSection,
    pub project: ProjectSection,
    pub workspace: WorkspaceSection,
    pub diagnostics: DiagnosticsSection,
    pub performance: PerformanceSection,
    pub output: OutputSection,
}

impl PenguinConfig {
    /// Builds the merged configuration from the precedence chain in §6.1:
    /// package defaults → project defaults → user config → project-local
    /// config → project-local overrides → env (`PENGUIN_` prefix).
    ///
    /// `project_root` is the directory searched for `.penguin/config.toml`
    /// and `settings.local.toml`; pass `None` to skip project-level layers
    /// (tests, or hosts that haven't located a project yet).
    pub fn load(project_root: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(PACKAGE_DEFAULTS, config::FileFormat::Toml));

        if let Some(root) = project_root {
            builder = builder
                .add_source(
                    config::File::from(root.join(".penguin").join("config.toml"))
                        .required(false),
                )
                .add_source(
                    config::File::from(root.join(".penguin").join("settings.local.toml"))
                        .required(false),
                );
        }

        if let Some(home) = dirs_home() {
            builder = builder.add_source(
                config::File::from(home.join(".config/penguin/config.toml")).required(false),
            );
        }

        if let Ok(path) = std::env::var("PENGUIN_CONFIG_PATH") {
            builder = builder.add_source(config::File::from(PathBuf::from(path)).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PENGUIN")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder.build()?;
        let config: PenguinConfig = merged.try_deserialize()?;
        config.validate_no_sharing_cycles()?;
        Ok(config)
    }

    /// Loads with no project root — package defaults + user config + env
    /// only. Useful before project detection has run.
    pub fn load_default() -> Result<Self> {
        Self::load(None)
    }

    pub fn default_model_id(&self) -> Option<&str> {
        self.model.default.as_deref()
    }

    pub fn persona(&self, name: &str) -> Option<&PersonaConfig> {
        self.agents.get(name)
    }

    /// Refuses cyclic `share_session_with`/`share_context_window_with`
    /// chains among personas (open-question decision #4 in DESIGN.md).
    pub fn validate_no_sharing_cycles(&self) -> Result<()> {
        for name in self.agents.keys() {
            let mut seen = std::collections::HashSet::new();
            let mut current = name.as_str();
            loop {
                if !seen.insert(current.to_string()) {
                    return Err(PenguinError::Config(format!(
                        "cyclic share_session_with/share_context_window_with chain involving '{name}'"
                    )));
                }
                let persona = match self.agents.get(current) {
                    Some(p) => p,
                    None => break,
                };
                let next = persona
                    .share_session_with
                    .as_deref()
                    .or(persona.share_context_window_with.as_deref());
                match next {
                    Some(n) => current = n,
                    None => break,
                }
            }
        }
        Ok(())
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_package_defaults_with_no_project_root() {
        let config = PenguinConfig::load(None).unwrap();
        assert!(config.model.default.is_some());
    }

    #[test]
    fn unknown_persona_is_none() {
        let config = PenguinConfig::default();
        assert!(config.persona("does-not-exist").is_none());
    }

    #[test]
    fn reasoning_config_disabled_yields_none_style() {
        let rc = ReasoningConfig {
            enabled: false,
            effort: Some(ReasoningEffort::High),
            max_tokens: None,
            exclude: false,
        };
        assert!(matches!(rc.into_style(), ReasoningStyle::None));
    }

    #[test]
    fn reasoning_config_effort_takes_precedence_over_max_tokens() {
        let rc = ReasoningConfig {
            enabled: true,
            effort: Some(ReasoningEffort::Low),
            max_tokens: Some(2048),
            exclude: false,
        };
        assert!(matches!(
            rc.into_style(),
            ReasoningStyle::Effort {
                effort: ReasoningEffort::Low
            }
        ));
    }

    #[test]
    fn detects_direct_sharing_cycle() {
        let mut config = PenguinConfig::default();
        config.agents.insert(
            "a".into(),
            PersonaConfig {
                share_session_with: Some("b".into()),
                ..Default::default()
            },
        );
        config.agents.insert(
            "b".into(),
            PersonaConfig {
                share_session_with: Some("a".into()),
                ..Default::default()
            },
        );
        assert!(config.validate_no_sharing_cycles().is_err());
    }

    #[test]
    fn accepts_acyclic_sharing_chain() {
        let mut config = PenguinConfig::default();
        config.agents.insert(
            "child".into(),
            PersonaConfig {
                share_session_with: Some("parent".into()),
                ..Default::default()
            },
        );
        config.agents.insert("parent".into(), PersonaConfig::default());
        assert!(config.validate_no_sharing_cycles().is_ok());
    }
}

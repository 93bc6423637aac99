//! Agent Registry / Core Facade (C11): multi-agent roster, personas,
//! parent/child sharing, and the primary external entry point for hosts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::action::{ActionParser, ActionParserConfig};
use crate::checkpoint::CheckpointSummary;
use crate::config::PenguinConfig;
use crate::conversation::manager::{ConversationManager, TokenUsage};
use crate::conversation::message::{MessageCategory, Role};
use crate::engine::{Engine, EngineConfig, StepOutcome};
use crate::error::{PenguinError, Result};
use crate::event::EventBus;
use crate::gateway::{litellm::LiteLlmGateway, native_anthropic::NativeAnthropicGateway, openrouter::OpenRouterGateway};
use crate::gateway::{ChunkSink, Gateway, GatewayOptions};
use crate::model::{ClientPreference, ModelRegistry, ModelSpec};
use crate::session::FileSessionStore;
use crate::tools::{RootPolicy, ToolRegistry};

/// A declarative persona bundle, applied at registration (§4.11).
#[derive(Debug, Clone, Default)]
pub struct Persona {
    pub system_prompt: Option<String>,
    pub default_tools: Vec<String>,
    pub model_override: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub agent_id: String,
    pub persona: Option<String>,
    pub parent_agent_id: Option<String>,
    pub session_id: Uuid,
    pub model_id: String,
    pub default_tools: Vec<String>,
    pub share_session: bool,
    pub share_context_window: bool,
}

#[derive(Debug, Default)]
pub struct RegisterAgentOptions {
    pub persona: Option<String>,
    pub model_id: Option<String>,
    pub default_tools: Option<Vec<String>>,
    pub activate: bool,
    pub parent_id: Option<String>,
    pub share_session: bool,
    pub share_context_window: bool,
}

#[derive(Debug, Serialize)]
pub struct ProcessOutcome {
    pub assistant_response: String,
    pub iterations: u32,
}

#[derive(Debug, Serialize)]
pub struct SystemInfo {
    pub agent_count: usize,
    pub active_agent: Option<String>,
    pub known_models: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub active_agent: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

fn build_gateway(config: &PenguinConfig, spec: &ModelSpec) -> Result<Arc<dyn Gateway>> {
    let api_key = spec
        .api_key_env
        .as_ref()
        .and_then(|env_var| std::env::var(env_var).ok())
        .unwrap_or_default();

    let gateway: Arc<dyn Gateway> = match spec.client_preference {
        ClientPreference::Native if spec.provider == "anthropic" => {
            Arc::new(NativeAnthropicGateway::new(api_key, spec.api_base.clone())?)
        }
        ClientPreference::Openrouter => Arc::new(OpenRouterGateway::new(api_key, spec.api_base.clone())?),
        _ => Arc::new(LiteLlmGateway::new(Some(api_key).filter(|k| !k.is_empty()), spec.api_base.clone())?),
    };
    let _ = config;
    Ok(gateway)
}

/// Owns the roster and the active-agent pointer (C11). This is the facade a
/// host (CLI, HTTP server, …) drives.
pub struct Core {
    config: PenguinConfig,
    model_registry: ModelRegistry,
    bus: Arc<EventBus>,
    tools: Arc<ToolRegistry>,
    session_store_root: PathBuf,
    agents: HashMap<String, AgentEntry>,
    conversations: HashMap<Uuid, Arc<Mutex<ConversationManager>>>,
    active_agent: Option<String>,
}

impl Core {
    pub fn new(config: PenguinConfig, project_root: PathBuf, workspace_root: PathBuf) -> Self {
        let session_store_root = project_root.join(".penguin").join("sessions");
        let roots = RootPolicy::new(project_root, workspace_root);
        Self {
            model_registry: ModelRegistry::new(config.clone()),
            config,
            bus: Arc::new(EventBus::new()),
            tools: Arc::new(ToolRegistry::new(roots)),
            session_store_root,
            agents: HashMap::new(),
            conversations: HashMap::new(),
            active_agent: None,
        }
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        self.tools.clone()
    }

    fn resolve_persona(&self, name: &str) -> Persona {
        match self.config.persona(name) {
            Some(cfg) => Persona {
                system_prompt: cfg.system_prompt.clone(),
                default_tools: cfg.default_tools.clone(),
                model_override: cfg.model_id.clone(),
            },
            None => Persona::default(),
        }
    }

    pub async fn register_agent(&mut self, agent_id: impl Into<String>, options: RegisterAgentOptions) -> Result<()> {
        let agent_id = agent_id.into();
        if let Some(parent) = &options.parent_id {
            if !self.agents.contains_key(parent) {
                return Err(PenguinError::InvalidRequest(format!("parent agent '{parent}' not registered")));
            }
        }
        // Re-check persona sharing chains before every registration (§9):
        // `PenguinConfig::load` already refuses a cyclic config at startup,
        // but a host may swap `self.config` at runtime, so this is the last
        // line of defense before an agent is actually inserted.
        self.config.validate_no_sharing_cycles()?;

        let persona = options.persona.as_ref().map(|name| self.resolve_persona(name));
        let model_id = options
            .model_id
            .clone()
            .or_else(|| persona.as_ref().and_then(|p| p.model_override.clone()))
            .or_else(|| self.config.default_model_id().map(|s| s.to_string()))
            .ok_or_else(|| PenguinError::Config("no model_id given and no default configured".into()))?;
        let model_spec = self.model_registry.resolve(&model_id)?;

        let (session_id, conversation) = if options.share_session {
            let parent_id = options
                .parent_id
                .as_ref()
                .ok_or_else(|| PenguinError::InvalidRequest("share_session requires parent_id".into()))?;
            let parent_session = self.agents[parent_id].session_id;
            let conversation = self.conversations[&parent_session].clone();
            (parent_session, conversation)
        } else {
            let store = FileSessionStore::new(&self.session_store_root);
            let manager = ConversationManager::new(agent_id.clone(), &model_spec, store);
            let session_id = manager.session_id();
            let conversation = Arc::new(Mutex::new(manager));
            self.conversations.insert(session_id, conversation.clone());
            (session_id, conversation)
        };

        if let Some(persona) = &persona {
            if let Some(system_prompt) = &persona.system_prompt {
                conversation.lock().await.set_system_prompt(system_prompt.clone());
            }
        }

        let default_tools = options
            .default_tools
            .or_else(|| persona.as_ref().map(|p| p.default_tools.clone()))
            .unwrap_or_default();

        let entry = AgentEntry {
            agent_id: agent_id.clone(),
            persona: options.persona.clone(),
            parent_agent_id: options.parent_id.clone(),
            session_id,
            model_id,
            default_tools,
            share_session: options.share_session,
            share_context_window: options.share_context_window,
        };
        self.agents.insert(agent_id.clone(), entry);

        if options.activate || self.active_agent.is_none() {
            self.active_agent = Some(agent_id);
        }
        Ok(())
    }

    pub async fn create_sub_agent(&mut self, agent_id: impl Into<String>, parent_id: impl Into<String>, mut options: RegisterAgentOptions) -> Result<()> {
        let parent_id = parent_id.into();
        if !self.agents.contains_key(&parent_id) {
            return Err(PenguinError::InvalidRequest(format!("parent agent '{parent_id}' not registered")));
        }
        options.parent_id = Some(parent_id);
        self.register_agent(agent_id, options).await
    }

    pub fn set_active_agent(&mut self, agent_id: &str) -> Result<()> {
        if !self.agents.contains_key(agent_id) {
            return Err(PenguinError::InvalidRequest(format!("unknown agent '{agent_id}'")));
        }
        self.active_agent = Some(agent_id.to_string());
        Ok(())
    }

    pub fn remove_agent(&mut self, agent_id: &str) -> Result<()> {
        if self.agents.len() <= 1 {
            return Err(PenguinError::InvalidRequest("cannot remove the last agent".into()));
        }
        let entry = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| PenguinError::InvalidRequest(format!("unknown agent '{agent_id}'")))?;

        let still_shared = self.agents.values().any(|a| a.session_id == entry.session_id);
        if !still_shared {
            self.conversations.remove(&entry.session_id);
        }

        if self.active_agent.as_deref() == Some(agent_id) {
            self.active_agent = self.agents.keys().next().cloned();
        }
        Ok(())
    }

    fn active_entry(&self) -> Result<&AgentEntry> {
        let id = self
            .active_agent
            .as_ref()
            .ok_or_else(|| PenguinError::InvalidRequest("no active agent".into()))?;
        Ok(&self.agents[id])
    }

    /// Primary entry point: binds the conversation, enqueues `input` as a
    /// user message, and runs the Engine to completion (§4.11).
    pub async fn process(
        &self,
        input: impl Into<String>,
        streaming: bool,
        sink: Option<Arc<dyn ChunkSink>>,
        max_iterations: Option<u32>,
    ) -> Result<ProcessOutcome> {
        let entry = self.active_entry()?;
        let model_spec = self.model_registry.resolve(&entry.model_id)?;
        let conversation = self.conversations[&entry.session_id].clone();
        let gateway = build_gateway(&self.config, &model_spec)?;
        let parser = Arc::new(ActionParser::new(ActionParserConfig::new(self.tools.names())));
        let engine = Engine::new(gateway, self.tools.clone(), parser, self.bus.clone(), EngineConfig::default());

        let mut locked = conversation.lock().await;
        locked
            .add_message(Role::User, input.into(), MessageCategory::Dialog, Some(&self.bus))
            .await?;

        let options = GatewayOptions {
            stream: streaming,
            ..GatewayOptions::default()
        };

        let outcome: StepOutcome = engine
            .run_task(&mut locked, &model_spec, &options, sink, CancellationToken::new(), max_iterations)
            .await?;

        Ok(ProcessOutcome {
            assistant_response: outcome.assistant_response,
            iterations: outcome.iterations,
        })
    }

    pub async fn run_continuous(&self, time_limit: Duration) -> Result<ProcessOutcome> {
        let entry = self.active_entry()?;
        let model_spec = self.model_registry.resolve(&entry.model_id)?;
        let conversation = self.conversations[&entry.session_id].clone();
        let gateway = build_gateway(&self.config, &model_spec)?;
        let parser = Arc::new(ActionParser::new(ActionParserConfig::new(self.tools.names())));
        let engine = Engine::new(gateway, self.tools.clone(), parser, self.bus.clone(), EngineConfig::default());

        let mut locked = conversation.lock().await;
        let outcome = engine
            .run_continuous(
                &mut locked,
                &model_spec,
                &GatewayOptions::default(),
                None,
                CancellationToken::new(),
                time_limit,
            )
            .await?;
        Ok(ProcessOutcome {
            assistant_response: outcome.assistant_response,
            iterations: outcome.iterations,
        })
    }

    pub fn get_system_info(&self) -> SystemInfo {
        SystemInfo {
            agent_count: self.agents.len(),
            active_agent: self.active_agent.clone(),
            known_models: self.model_registry.known_models(),
        }
    }

    pub async fn get_system_status(&self) -> SystemStatus {
        let token_usage = match self.active_entry() {
            Ok(entry) => {
                let conversation = self.conversations[&entry.session_id].clone();
                Some(conversation.lock().await.get_token_usage())
            }
            Err(_) => None,
        };
        SystemStatus {
            active_agent: self.active_agent.clone(),
            token_usage,
        }
    }

    pub async fn get_token_usage(&self) -> Result<TokenUsage> {
        let entry = self.active_entry()?;
        let conversation = self.conversations[&entry.session_id].clone();
        Ok(conversation.lock().await.get_token_usage())
    }

    pub async fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointSummary>> {
        let entry = self.active_entry()?;
        let conversation = self.conversations[&entry.session_id].clone();
        Ok(conversation.lock().await.list_checkpoints(limit))
    }

    pub async fn create_checkpoint(&self, name: Option<String>, description: Option<String>) -> Result<Uuid> {
        let entry = self.active_entry()?;
        let conversation = self.conversations[&entry.session_id].clone();
        Ok(conversation
            .lock()
            .await
            .create_manual_checkpoint(name, description, Some(&self.bus))
            .await)
    }

    pub async fn rollback_to_checkpoint(&self, checkpoint_id: Uuid) -> Result<()> {
        let entry = self.active_entry()?;
        let conversation = self.conversations[&entry.session_id].clone();
        conversation
            .lock()
            .await
            .rollback_to_checkpoint(checkpoint_id, Some(&self.bus))
            .await
            .ok_or_else(|| PenguinError::InvalidRequest(format!("unknown checkpoint '{checkpoint_id}'")))
    }

    pub async fn branch_from_checkpoint(&mut self, checkpoint_id: Uuid, name: Option<String>) -> Result<Uuid> {
        let entry = self.active_entry()?.clone();
        let conversation = self.conversations[&entry.session_id].clone();
        let branched = conversation
            .lock()
            .await
            .branch_from_checkpoint(checkpoint_id, name, Some(&self.bus))
            .await
            .ok_or_else(|| PenguinError::InvalidRequest(format!("unknown checkpoint '{checkpoint_id}'")))?;

        let new_session_id = branched.id;
        let store = FileSessionStore::new(&self.session_store_root);
        store.save(&branched).await?;
        let model_spec = self.model_registry.resolve(&entry.model_id)?;
        let mut manager = ConversationManager::new(entry.agent_id.clone(), &model_spec, store);
        manager.load(new_session_id).await?;
        self.conversations.insert(new_session_id, Arc::new(Mutex::new(manager)));
        Ok(new_session_id)
    }

    /// Atomically swaps the active agent's [`ModelSpec`] (§4.11 `load_model`).
    pub async fn load_model(&mut self, model_id: &str) -> Result<()> {
        let agent_id = self
            .active_agent
            .clone()
            .ok_or_else(|| PenguinError::InvalidRequest("no active agent".into()))?;
        let model_spec = self.model_registry.resolve(model_id)?;
        let session_id = self.agents[&agent_id].session_id;
        let conversation = self.conversations[&session_id].clone();
        conversation.lock().await.reconfigure_model(&model_spec)?;

        self.bus
            .publish(
                crate::event::EventType::ModelChanged,
                serde_json::json!({ "agent_id": agent_id, "model_id": model_id }),
                crate::event::Priority::Normal,
            )
            .await;

        if let Some(entry) = self.agents.get_mut(&agent_id) {
            entry.model_id = model_id.to_string();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn core() -> Core {
        let dir = tempdir().unwrap();
        Core::new(PenguinConfig::default(), dir.path().to_path_buf(), dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn registering_first_agent_activates_it() {
        let mut core = core();
        core.register_agent("main", RegisterAgentOptions::default()).await.unwrap();
        assert_eq!(core.get_system_info().active_agent.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn sub_agent_requires_existing_parent() {
        let mut core = core();
        let err = core
            .create_sub_agent("child", "missing-parent", RegisterAgentOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PenguinError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn shared_session_sub_agent_sees_parent_messages() {
        let mut core = core();
        core.register_agent("parent", RegisterAgentOptions::default()).await.unwrap();
        core.create_sub_agent(
            "child",
            "parent",
            RegisterAgentOptions {
                share_session: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(core.agents["parent"].session_id, core.agents["child"].session_id);
    }

    #[tokio::test]
    async fn cannot_remove_last_agent() {
        let mut core = core();
        core.register_agent("only", RegisterAgentOptions::default()).await.unwrap();
        let err = core.remove_agent("only").unwrap_err();
        assert!(matches!(err, PenguinError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn removing_non_active_agent_keeps_active_agent() {
        let mut core = core();
        core.register_agent("main", RegisterAgentOptions::default()).await.unwrap();
        core.register_agent(
            "second",
            RegisterAgentOptions {
                activate: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        core.remove_agent("second").unwrap();
        assert_eq!(core.get_system_info().active_agent.as_deref(), Some("main"));
    }
}

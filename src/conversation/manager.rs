use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{Message, MessageCategory, Role};
use crate::checkpoint::{CheckpointManager, CheckpointSummary, CheckpointType};
use crate::context_window::ContextWindow;
use crate::error::Result;
use crate::event::{EventBus, EventType, Priority};
use crate::model::ModelSpec;
use crate::session::{FileSessionStore, Session};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenUsage {
    pub current_total: u32,
    pub max_tokens: u32,
    pub per_category: Vec<(MessageCategory, u32)>,
    pub truncations: usize,
}

/// Every `checkpoint_frequency`-th appended message triggers an AUTO
/// checkpoint (default: every message, §4.8).
#[derive(Debug, Clone, Copy)]
pub struct CheckpointPolicy {
    pub frequency: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self { frequency: 1 }
    }
}

/// Owns exactly one [`Session`], one [`ContextWindow`], and one
/// [`CheckpointManager`] (§4.9). When agents share a session, a single
/// instance backs both — callers wrap it in `Arc<tokio::sync::Mutex<_>>` to
/// serialize `add_message` and preserve append order (§5).
pub struct ConversationManager {
    session: Session,
    context_window: ContextWindow,
    checkpoints: CheckpointManager,
    checkpoint_policy: CheckpointPolicy,
    messages_since_checkpoint: u32,
    store: FileSessionStore,
}

impl ConversationManager {
    pub fn new(agent_id: impl Into<String>, model: &ModelSpec, store: FileSessionStore) -> Self {
        Self {
            session: Session::new(agent_id),
            context_window: ContextWindow::new(model),
            checkpoints: CheckpointManager::new(),
            checkpoint_policy: CheckpointPolicy::default(),
            messages_since_checkpoint: 0,
            store,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    pub async fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        category: MessageCategory,
        bus: Option<&EventBus>,
    ) -> Result<()> {
        let message = Message::new(role, content, category);
        self.session.messages.push(message.clone());
        self.session.touch();
        let truncations = self.context_window.enforce(&mut self.session.messages)?;

        self.messages_since_checkpoint += 1;
        let mut created_checkpoint = None;
        if self.messages_since_checkpoint >= self.checkpoint_policy.frequency {
            let checkpoint_id = self.checkpoints.create(
                self.session.id,
                CheckpointType::Auto,
                self.session.messages.clone(),
                self.session.system_prompt.clone(),
                None,
                None,
                None,
            );
            created_checkpoint = Some((checkpoint_id, CheckpointType::Auto, None::<String>));
            self.messages_since_checkpoint = 0;
        }

        if let Some(bus) = bus {
            bus.publish(
                EventType::Message,
                serde_json::to_value(&message).unwrap_or_default(),
                Priority::Normal,
            )
            .await;

            for event in &truncations {
                bus.publish(
                    EventType::Truncation,
                    serde_json::to_value(event).unwrap_or_default(),
                    Priority::Normal,
                )
                .await;
            }

            if let Some((id, checkpoint_type, name)) = created_checkpoint {
                bus.publish(
                    EventType::CheckpointCreated,
                    serde_json::json!({ "id": id, "type": checkpoint_type, "name": name }),
                    Priority::Low,
                )
                .await;
            }
        }
        Ok(())
    }

    /// Replaces the single SYSTEM-category message (uniqueness invariant, §3).
    pub fn set_system_prompt(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.session.messages.retain(|m| m.category != MessageCategory::System);
        self.session.system_prompt = Some(text.clone());
        self.session
            .messages
            .insert(0, Message::new(Role::System, text, MessageCategory::System));
    }

    /// Shaped for gateway submission: system hoisted, tool rewrites deferred
    /// to the gateway itself (§4.9).
    pub fn get_history(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn reset(&mut self) {
        let agent_id = self.session.agent_id.clone();
        self.session = Session::new(agent_id);
        self.messages_since_checkpoint = 0;
    }

    pub async fn save(&self) -> Result<()> {
        self.store.save(&self.session).await
    }

    pub async fn load(&mut self, session_id: Uuid) -> Result<()> {
        self.session = self.store.load(session_id).await?;
        Ok(())
    }

    pub async fn delete(&self, session_id: Uuid) -> Result<()> {
        self.store.delete(session_id).await
    }

    /// Swaps the active [`ModelSpec`], rebuilding the context window against
    /// the new budgets; existing messages are preserved but may trigger a
    /// trim pass (§4.11 `load_model`).
    pub fn reconfigure_model(&mut self, model: &ModelSpec) -> Result<()> {
        self.context_window = ContextWindow::new(model);
        self.context_window.enforce(&mut self.session.messages)
    }

    pub fn get_token_usage(&self) -> TokenUsage {
        TokenUsage {
            current_total: self.context_window.total_tokens(&self.session.messages),
            max_tokens: self.context_window.max_tokens(),
            per_category: self.context_window.current_tokens_per_category(&self.session.messages),
            truncations: self.context_window.truncation_log().count(),
        }
    }

    pub fn list_checkpoints(&self, limit: usize) -> Vec<CheckpointSummary> {
        self.checkpoints.list(self.session.id, limit)
    }

    pub async fn create_manual_checkpoint(
        &mut self,
        name: Option<String>,
        description: Option<String>,
        bus: Option<&EventBus>,
    ) -> Uuid {
        let id = self.checkpoints.create(
            self.session.id,
            CheckpointType::Manual,
            self.session.messages.clone(),
            self.session.system_prompt.clone(),
            name.clone(),
            description,
            None,
        );
        publish_checkpoint_created(bus, id, CheckpointType::Manual, name).await;
        id
    }

    pub async fn rollback_to_checkpoint(&mut self, checkpoint_id: Uuid, bus: Option<&EventBus>) -> Option<()> {
        let (messages, system_prompt, safety_id) = self.checkpoints.rollback(
            checkpoint_id,
            self.session.messages.clone(),
            self.session.system_prompt.clone(),
        )?;
        self.session.messages = messages;
        self.session.system_prompt = system_prompt;
        publish_checkpoint_created(bus, safety_id, CheckpointType::Rollback, None).await;
        Some(())
    }

    pub async fn branch_from_checkpoint(
        &mut self,
        checkpoint_id: Uuid,
        name: Option<String>,
        bus: Option<&EventBus>,
    ) -> Option<Session> {
        let (checkpoint, branch_id) = self.checkpoints.branch(checkpoint_id, name.clone())?;
        let mut branched = Session::new(self.session.agent_id.clone());
        branched.parent_session_id = Some(self.session.id);
        branched.messages = checkpoint.messages;
        branched.system_prompt = checkpoint.system_prompt;
        publish_checkpoint_created(bus, branch_id, CheckpointType::Branch, name).await;
        Some(branched)
    }
}

async fn publish_checkpoint_created(
    bus: Option<&EventBus>,
    id: Uuid,
    checkpoint_type: CheckpointType,
    name: Option<String>,
) {
    if let Some(bus) = bus {
        bus.publish(
            EventType::CheckpointCreated,
            serde_json::json!({ "id": id, "type": checkpoint_type, "name": name }),
            Priority::Low,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PenguinConfig;
    use crate::model::ModelRegistry;
    use tempfile::tempdir;

    async fn manager() -> ConversationManager {
        let registry = ModelRegistry::new(PenguinConfig::default());
        let model = registry.resolve("anthropic/claude-sonnet-4").unwrap();
        let dir = tempdir().unwrap();
        ConversationManager::new("agent-1", &model, FileSessionStore::new(dir.path()))
    }

    #[tokio::test]
    async fn add_message_appends_and_checkpoints_by_default_every_message() {
        let mut convo = manager().await;
        convo.add_message(Role::User, "hi", MessageCategory::Dialog, None).await.unwrap();
        assert_eq!(convo.get_history().len(), 1);
        assert_eq!(convo.list_checkpoints(10).len(), 1);
    }

    #[tokio::test]
    async fn set_system_prompt_is_unique() {
        let mut convo = manager().await;
        convo.set_system_prompt("first");
        convo.set_system_prompt("second");
        let system_count = convo
            .get_history()
            .iter()
            .filter(|m| m.category == MessageCategory::System)
            .count();
        assert_eq!(system_count, 1);
    }

    #[tokio::test]
    async fn reset_clears_session_but_keeps_agent_id() {
        let mut convo = manager().await;
        convo.add_message(Role::User, "hi", MessageCategory::Dialog, None).await.unwrap();
        convo.reset();
        assert_eq!(convo.get_history().len(), 0);
    }

    #[tokio::test]
    async fn rollback_restores_prior_snapshot() {
        let mut convo = manager().await;
        convo.add_message(Role::User, "first", MessageCategory::Dialog, None).await.unwrap();
        let checkpoint_id = convo.list_checkpoints(1)[0].id;
        convo.add_message(Role::User, "second", MessageCategory::Dialog, None).await.unwrap();
        convo.rollback_to_checkpoint(checkpoint_id, None).await.unwrap();
        assert_eq!(convo.get_history().len(), 1);
    }
}

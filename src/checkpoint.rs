//! Checkpoint Manager (C8): snapshot, rollback, and branch of a session's
//! message history, with AUTO-checkpoint retention that respects branch
//! lineage.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::conversation::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckpointType {
    Auto,
    Manual,
    Branch,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: Uuid,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub checkpoint_type: CheckpointType,
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_checkpoint_id: Option<Uuid>,
    pub messages: Vec<Message>,
    pub system_prompt: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub checkpoint_type: CheckpointType,
    pub name: Option<String>,
    pub message_count: usize,
}

impl From<&Checkpoint> for CheckpointSummary {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.id,
            created_at: checkpoint.created_at,
            checkpoint_type: checkpoint.checkpoint_type,
            name: checkpoint.name.clone(),
            message_count: checkpoint.messages.len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_auto_count: usize,
    pub max_auto_age: chrono::Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_auto_count: 50,
            max_auto_age: chrono::Duration::days(7),
        }
    }
}

/// One per session. Checkpoints live in memory here; persistence is the
/// Session Store's job (a checkpoint is serialized as part of the session
/// file it belongs to, or separately — see DESIGN.md).
#[derive(Default)]
pub struct CheckpointManager {
    checkpoints: HashMap<Uuid, Checkpoint>,
    retention: RetentionPolicy,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: RetentionPolicy) -> Self {
        Self {
            checkpoints: HashMap::new(),
            retention,
        }
    }

    pub fn create(
        &mut self,
        session_id: Uuid,
        checkpoint_type: CheckpointType,
        messages: Vec<Message>,
        system_prompt: Option<String>,
        name: Option<String>,
        description: Option<String>,
        parent_checkpoint_id: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let checkpoint = Checkpoint {
            id,
            session_id,
            created_at: Utc::now(),
            checkpoint_type,
            name,
            description,
            parent_checkpoint_id,
            messages,
            system_prompt,
            metadata: serde_json::json!({}),
        };
        self.checkpoints.insert(id, checkpoint);
        if checkpoint_type == CheckpointType::Auto {
            self.prune_auto();
        }
        id
    }

    pub fn get(&self, checkpoint_id: Uuid) -> Option<&Checkpoint> {
        self.checkpoints.get(&checkpoint_id)
    }

    /// Newest first (§4.8).
    pub fn list(&self, session_id: Uuid, limit: usize) -> Vec<CheckpointSummary> {
        let mut matching: Vec<&Checkpoint> = self
            .checkpoints
            .values()
            .filter(|c| c.session_id == session_id)
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.into_iter().take(limit).map(CheckpointSummary::from).collect()
    }

    /// Returns the snapshot to roll back to plus the id of the `ROLLBACK`-type
    /// checkpoint recorded to preserve the pre-rollback state for safety
    /// (§4.8).
    pub fn rollback(
        &mut self,
        checkpoint_id: Uuid,
        current_messages: Vec<Message>,
        current_system_prompt: Option<String>,
    ) -> Option<(Vec<Message>, Option<String>, Uuid)> {
        let target = self.checkpoints.get(&checkpoint_id)?.clone();
        let safety_id = self.create(
            target.session_id,
            CheckpointType::Rollback,
            current_messages,
            current_system_prompt,
            None,
            Some(format!("pre-rollback snapshot before restoring {checkpoint_id}")),
            Some(checkpoint_id),
        );
        Some((target.messages, target.system_prompt, safety_id))
    }

    /// Returns the snapshot to seed a new branched session with, plus the id
    /// of the new `BRANCH`-type checkpoint recorded for it; the caller
    /// (Conversation Manager) creates the new session and assigns its id.
    pub fn branch(&mut self, checkpoint_id: Uuid, name: Option<String>) -> Option<(Checkpoint, Uuid)> {
        let target = self.checkpoints.get(&checkpoint_id)?.clone();
        let branch_id = self.create(
            target.session_id,
            CheckpointType::Branch,
            target.messages.clone(),
            target.system_prompt.clone(),
            name,
            None,
            Some(checkpoint_id),
        );
        Some((target, branch_id))
    }

    /// Removes AUTO checkpoints beyond `max_auto_count` or `max_auto_age`,
    /// never pruning one still referenced as a `parent_checkpoint_id` by a
    /// surviving checkpoint (open-question decision #2 in DESIGN.md).
    fn prune_auto(&mut self) {
        let referenced: std::collections::HashSet<Uuid> = self
            .checkpoints
            .values()
            .filter_map(|c| c.parent_checkpoint_id)
            .collect();

        let now = Utc::now();
        let mut auto_ids: Vec<Uuid> = self
            .checkpoints
            .values()
            .filter(|c| c.checkpoint_type == CheckpointType::Auto && !referenced.contains(&c.id))
            .map(|c| c.id)
            .collect();

        auto_ids.retain(|id| {
            let checkpoint = &self.checkpoints[id];
            now.signed_duration_since(checkpoint.created_at) > self.retention.max_auto_age
        });

        let mut all_auto: Vec<&Checkpoint> = self
            .checkpoints
            .values()
            .filter(|c| c.checkpoint_type == CheckpointType::Auto && !referenced.contains(&c.id))
            .collect();
        all_auto.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if all_auto.len() > self.retention.max_auto_count {
            let overflow = all_auto.len() - self.retention.max_auto_count;
            for checkpoint in all_auto.into_iter().take(overflow) {
                if !auto_ids.contains(&checkpoint.id) {
                    auto_ids.push(checkpoint.id);
                }
            }
        }

        for id in auto_ids {
            self.checkpoints.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_snapshots_pre_rollback_state_for_safety() {
        let mut manager = CheckpointManager::new();
        let session_id = Uuid::new_v4();
        let original = manager.create(
            session_id,
            CheckpointType::Manual,
            vec![Message::user("original")],
            None,
            None,
            None,
            None,
        );
        let (restored, _, _safety_id) = manager
            .rollback(original, vec![Message::user("current")], None)
            .unwrap();
        assert_eq!(restored[0].content.as_text(), "original");
        assert_eq!(manager.list(session_id, 10).len(), 2);
    }

    #[test]
    fn branch_creates_a_branch_typed_checkpoint_with_parent() {
        let mut manager = CheckpointManager::new();
        let session_id = Uuid::new_v4();
        let origin = manager.create(
            session_id,
            CheckpointType::Manual,
            vec![Message::user("origin")],
            None,
            None,
            None,
            None,
        );
        let (_, branch_id) = manager.branch(origin, Some("experiment".into())).unwrap();
        assert_ne!(branch_id, origin);
        let summaries = manager.list(session_id, 10);
        assert!(summaries
            .iter()
            .any(|s| s.checkpoint_type == CheckpointType::Branch));
    }

    #[test]
    fn pruning_never_removes_a_checkpoint_referenced_by_a_surviving_branch() {
        let mut manager = CheckpointManager::with_retention(RetentionPolicy {
            max_auto_count: 1,
            max_auto_age: chrono::Duration::days(365),
        });
        let session_id = Uuid::new_v4();
        let first_auto = manager.create(
            session_id,
            CheckpointType::Auto,
            vec![Message::user("a")],
            None,
            None,
            None,
            None,
        );
        // A manual branch off the first AUTO checkpoint references it as parent.
        manager.branch(first_auto, None);
        for i in 0..5 {
            manager.create(
                session_id,
                CheckpointType::Auto,
                vec![Message::user(format!("auto {i}"))],
                None,
                None,
                None,
                None,
            );
        }
        assert!(manager.get(first_auto).is_some());
    }
}

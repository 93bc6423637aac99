//! Context-Window Manager (C7): per-category token budgets and trimming.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::conversation::message::{Message, MessageCategory};
use crate::error::{PenguinError, Result};
use crate::model::ModelSpec;

const TRUNCATION_LOG_CAPACITY: usize = 200;
/// Most recent N dialog turns (user+assistant pairs) preserved unconditionally (§4.7).
const PROTECTED_DIALOG_TURNS: usize = 2;
/// Round-robin trim order once per-category trimming alone isn't enough (§4.7 step 3).
const ROUND_ROBIN_ORDER: [MessageCategory; 4] = [
    MessageCategory::ToolResult,
    MessageCategory::Reasoning,
    MessageCategory::Context,
    MessageCategory::Dialog,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncationEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: MessageCategory,
    pub messages_removed: usize,
    pub tokens_freed: u32,
}

/// Bound per-category budgets and a bounded truncation log, scoped to one
/// conversation (never process-global).
pub struct ContextWindow {
    max_tokens: u32,
    budgets: [(MessageCategory, u32); 5],
    truncation_log: VecDeque<TruncationEvent>,
}

impl ContextWindow {
    pub fn new(model: &ModelSpec) -> Self {
        let max_tokens = model.max_history_tokens;
        let budgets = MessageCategory::ALL.map(|c| {
            (c, (max_tokens as f64 * c.default_fraction()).floor() as u32)
        });
        Self {
            max_tokens,
            budgets,
            truncation_log: VecDeque::with_capacity(TRUNCATION_LOG_CAPACITY),
        }
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn budget_for(&self, category: MessageCategory) -> u32 {
        self.budgets
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, b)| *b)
            .unwrap_or(0)
    }

    pub fn current_tokens_per_category(&self, messages: &[Message]) -> Vec<(MessageCategory, u32)> {
        MessageCategory::ALL
            .into_iter()
            .map(|category| {
                let sum = messages
                    .iter()
                    .filter(|m| m.category == category)
                    .map(|m| m.estimate_tokens())
                    .sum();
                (category, sum)
            })
            .collect()
    }

    pub fn total_tokens(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| m.estimate_tokens()).sum()
    }

    /// Trims `messages` in place to fit the budgets, oldest-first within a
    /// category, protecting SYSTEM entirely and the last
    /// [`PROTECTED_DIALOG_TURNS`] dialog turns unconditionally. Returns the
    /// per-category [`TruncationEvent`]s produced, so the caller can publish
    /// a `TRUNCATION` event per removal (§4.7 step 4, §6.4). Returns
    /// `Err(ContextLengthExceeded)` only if trimming every trimmable message
    /// still leaves the total over budget.
    pub fn enforce(&mut self, messages: &mut Vec<Message>) -> Result<Vec<TruncationEvent>> {
        let mut events = Vec::new();

        for category in MessageCategory::ALL {
            if category == MessageCategory::System {
                continue;
            }
            if let Some(event) = self.trim_category(messages, category, self.budget_for(category)) {
                events.push(event);
            }
        }

        if self.total_tokens(messages) > self.max_tokens {
            for category in ROUND_ROBIN_ORDER {
                if self.total_tokens(messages) <= self.max_tokens {
                    break;
                }
                if let Some(event) = self.trim_category(messages, category, 0) {
                    events.push(event);
                }
            }
        }

        if self.total_tokens(messages) > self.max_tokens {
            return Err(PenguinError::ContextLengthExceeded {
                used: self.total_tokens(messages) as usize,
                limit: self.max_tokens as usize,
            });
        }
        Ok(events)
    }

    fn trim_category(
        &mut self,
        messages: &mut Vec<Message>,
        category: MessageCategory,
        budget: u32,
    ) -> Option<TruncationEvent> {
        let protected_ids = protected_dialog_ids(messages, category);
        let mut removed = 0usize;
        let mut freed = 0u32;

        loop {
            let current: u32 = messages
                .iter()
                .filter(|m| m.category == category)
                .map(|m| m.estimate_tokens())
                .sum();
            if current <= budget {
                break;
            }
            let victim_index = messages
                .iter()
                .position(|m| m.category == category && !protected_ids.contains(&m.id));
            let Some(index) = victim_index else { break };
            let tokens = messages[index].estimate_tokens();
            messages.remove(index);
            removed += 1;
            freed += tokens;
        }

        if removed == 0 {
            return None;
        }

        if self.truncation_log.len() == TRUNCATION_LOG_CAPACITY {
            self.truncation_log.pop_front();
        }
        let event = TruncationEvent {
            timestamp: chrono::Utc::now(),
            category,
            messages_removed: removed,
            tokens_freed: freed,
        };
        self.truncation_log.push_back(event.clone());
        Some(event)
    }

    pub fn truncation_log(&self) -> impl Iterator<Item = &TruncationEvent> {
        self.truncation_log.iter()
    }
}

fn protected_dialog_ids(messages: &[Message], category: MessageCategory) -> Vec<uuid::Uuid> {
    if category != MessageCategory::Dialog {
        return Vec::new();
    }
    messages
        .iter()
        .rev()
        .filter(|m| m.category == MessageCategory::Dialog)
        .take(PROTECTED_DIALOG_TURNS * 2)
        .map(|m| m.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_model() -> ModelSpec {
        let registry = crate::model::ModelRegistry::new(crate::config::PenguinConfig::default());
        let mut spec = registry.resolve("anthropic/claude-sonnet-4").unwrap();
        spec.max_context_window_tokens = 1000;
        spec.max_history_tokens = 850;
        spec
    }

    #[test]
    fn system_messages_are_never_trimmed() {
        let model = small_model();
        let mut window = ContextWindow::new(&model);
        let mut messages: Vec<Message> = vec![Message::system("x".repeat(10_000))];
        let result = window.enforce(&mut messages);
        assert!(result.is_err());
        assert_eq!(messages.len(), 1);
    }

    #[test]
    fn oldest_dialog_messages_trimmed_first_preserving_last_turn() {
        let model = small_model();
        let mut window = ContextWindow::new(&model);
        let mut messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("message number {i} padded out a fair bit")))
            .collect();
        window.enforce(&mut messages).unwrap();
        assert!(messages.len() < 20);
        let texts: Vec<String> = messages.iter().map(|m| m.content.as_text()).collect();
        assert!(texts.iter().any(|t| t.contains("message number 19")));
    }

    #[test]
    fn truncation_is_logged() {
        let model = small_model();
        let mut window = ContextWindow::new(&model);
        let mut messages: Vec<Message> = (0..20)
            .map(|i| Message::user(format!("message {i}").repeat(20)))
            .collect();
        let events = window.enforce(&mut messages).unwrap();
        assert!(!events.is_empty());
        assert!(window.truncation_log().count() > 0);
    }

    #[test]
    fn unreasonable_single_message_yields_context_too_large() {
        let model = small_model();
        let mut window = ContextWindow::new(&model);
        let mut messages = vec![Message::system("s".repeat(20_000))];
        let result = window.enforce(&mut messages);
        assert!(matches!(result, Err(PenguinError::ContextLengthExceeded { .. })));
    }
}

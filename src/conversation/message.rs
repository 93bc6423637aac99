//! Message data model shared by the Conversation Manager (C9), Context
//! Window (C7), Checkpoint Manager (C8), and Gateway (C5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Budget category a message counts against in the Context Window (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageCategory {
    System,
    Context,
    Dialog,
    ToolResult,
    Reasoning,
}

impl MessageCategory {
    pub const ALL: [MessageCategory; 5] = [
        MessageCategory::System,
        MessageCategory::Context,
        MessageCategory::Dialog,
        MessageCategory::ToolResult,
        MessageCategory::Reasoning,
    ];

    /// Default budget fraction of `max_tokens` (§3), summing to 1.0.
    pub fn default_fraction(self) -> f64 {
        match self {
            MessageCategory::System => 0.10,
            MessageCategory::Context => 0.30,
            MessageCategory::Dialog => 0.45,
            MessageCategory::ToolResult => 0.10,
            MessageCategory::Reasoning => 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String },
    ImageDataUri { data_uri: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Content {
    pub fn as_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Rough token estimate when no provider/tokenizer count is available:
    /// chars/4 for text, 1300 per image (§4.7).
    pub fn estimate_tokens(&self) -> u32 {
        match self {
            Content::Text(text) => (text.chars().count() as f64 / 4.0).ceil() as u32,
            Content::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => (text.chars().count() as f64 / 4.0).ceil() as u32,
                    ContentPart::ImageUrl { .. } | ContentPart::ImageDataUri { .. } => 1300,
                })
                .sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub role: Role,
    pub content: Content,
    pub category: MessageCategory,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, category: MessageCategory) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: Content::Text(content.into()),
            category,
            timestamp: Utc::now(),
            metadata: serde_json::json!({}),
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, MessageCategory::System)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, MessageCategory::Dialog)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessageCategory::Dialog)
    }

    pub fn tool_result(content: impl Into<String>, tool_call_id: Option<String>) -> Self {
        let mut message = Self::new(Role::Tool, content, MessageCategory::ToolResult);
        message.tool_call_id = tool_call_id;
        message
    }

    pub fn reasoning(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, MessageCategory::Reasoning)
    }

    pub fn estimate_tokens(&self) -> u32 {
        self.content.estimate_tokens()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_fractions_sum_to_one() {
        let sum: f64 = MessageCategory::ALL.iter().map(|c| c.default_fraction()).sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn text_content_token_estimate_is_chars_over_four() {
        let content = Content::Text("a".repeat(40));
        assert_eq!(content.estimate_tokens(), 10);
    }

    #[test]
    fn image_part_costs_a_flat_1300_tokens() {
        let content = Content::Parts(vec![ContentPart::ImageUrl {
            url: "https://example.com/x.png".into(),
        }]);
        assert_eq!(content.estimate_tokens(), 1300);
    }
}

//! LLM Gateway (C5): one adapter per client preference, behind a uniform
//! [`Gateway`] trait. SSE responses are decoded with hand-rolled `data: `
//! line scanning rather than a dedicated SSE crate.

pub mod litellm;
pub mod native_anthropic;
pub mod openrouter;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::message::{Content, Message, Role};
use crate::error::{PenguinError, Result};
use crate::event::{EventBus, EventType, Priority};
use crate::model::{ModelSpec, ReasoningStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkTag {
    Assistant,
    Reasoning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub tag: ChunkTag,
    pub text: String,
}

/// Receives streamed chunks as they arrive. Kept as an async trait (rather
/// than a plain closure) so a host can forward chunks onto the Event Bus,
/// which itself is only usable from async context.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn on_chunk(&self, chunk: StreamChunk);
}

#[async_trait]
impl<F> ChunkSink for F
where
    F: Fn(StreamChunk) + Send + Sync,
{
    async fn on_chunk(&self, chunk: StreamChunk) {
        (self)(chunk)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub max_output_tokens: u32,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<Value>>,
    pub tool_choice: Option<Value>,
    pub reasoning: Option<ReasoningStyle>,
    pub vision: bool,
    pub stream: bool,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            max_output_tokens: 4096,
            temperature: None,
            tools: None,
            tool_choice: None,
            reasoning: None,
            vision: false,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatewayResponse {
    pub text: String,
    pub reasoning_text: Option<String>,
    pub usage: Option<TokenUsage>,
}

/// Uniform provider contract (§4.5). One instance per `(model, client)`
/// pair; adapters hold their own `reqwest::Client`.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn provider(&self) -> &str;

    fn supports_system_messages(&self) -> bool {
        true
    }

    /// Best-effort token count; adapters without a native endpoint fall
    /// back to the character-ratio estimator on [`Content`].
    fn count_tokens(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| m.estimate_tokens()).sum()
    }

    /// Runs one call against the provider. When `options.stream` is set and
    /// `sink` is `Some`, incremental chunks are forwarded as they arrive;
    /// the full text is always returned regardless of streaming mode.
    /// `cancel` allows a caller to abort an in-flight stream cleanly —
    /// whatever text has accumulated so far is returned rather than
    /// discarded (§4.5.6). When `bus` is `Some`, a `STREAM_END` event
    /// carrying token-usage stats is published once the call completes
    /// (§4.5.4, §6.4).
    async fn get_response(
        &self,
        model: &ModelSpec,
        messages: &[Message],
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: tokio_util::sync::CancellationToken,
        bus: Option<&EventBus>,
    ) -> Result<GatewayResponse>;
}

/// Publishes `STREAM_END` with the response's token-usage stats, if a bus
/// was given (§4.5.4).
pub async fn publish_stream_end(bus: Option<&EventBus>, provider: &str, response: &GatewayResponse) {
    if let Some(bus) = bus {
        bus.publish(
            EventType::StreamEnd,
            serde_json::json!({ "provider": provider, "usage": response.usage }),
            Priority::Normal,
        )
        .await;
    }
}

/// Formats messages for submission: hoists the system message out for
/// providers that support it, and applies tool-call sanitization (§4.5.3).
pub fn format_messages(messages: &[Message], hoist_system: bool) -> (Option<String>, Vec<Message>) {
    let sanitized = sanitize_tool_messages(messages);

    if !hoist_system {
        return (None, sanitized);
    }

    let mut system = None;
    let mut rest = Vec::with_capacity(sanitized.len());
    for message in sanitized {
        if message.role == Role::System && system.is_none() {
            system = Some(message.content.as_text());
        } else {
            rest.push(message);
        }
    }
    (system, rest)
}

/// A `tool`-role message is only legal immediately following an assistant
/// message that declared a matching `tool_calls` entry in its metadata. Any
/// other `tool` message is rewritten to a plain `assistant` message prefixed
/// with `[Tool Result]`, and orphan `tool_call_id` text references are
/// redacted — the "aggressive reformat" contract (§4.5.3).
fn sanitize_tool_messages(messages: &[Message]) -> Vec<Message> {
    let mut out = Vec::with_capacity(messages.len());
    let mut preceding_had_tool_calls = false;

    for message in messages {
        match message.role {
            Role::Assistant => {
                preceding_had_tool_calls = message
                    .metadata
                    .get("tool_calls")
                    .map(|v| v.is_array())
                    .unwrap_or(false);
                out.push(redact_orphan_tool_refs(message));
            }
            Role::Tool if preceding_had_tool_calls && message.tool_call_id.is_some() => {
                out.push(message.clone());
                preceding_had_tool_calls = false;
            }
            Role::Tool => {
                let text = format!("[Tool Result] {}", message.content.as_text());
                let mut rewritten = message.clone();
                rewritten.role = Role::Assistant;
                rewritten.content = Content::Text(text);
                rewritten.tool_call_id = None;
                out.push(rewritten);
                preceding_had_tool_calls = false;
            }
            _ => {
                preceding_had_tool_calls = false;
                out.push(redact_orphan_tool_refs(message));
            }
        }
    }
    out
}

fn redact_orphan_tool_refs(message: &Message) -> Message {
    let text = message.content.as_text();
    if !text.contains("tool_call_id") {
        return message.clone();
    }
    let re = regex::Regex::new(r"tool_call_id[:=]\s*\S+").unwrap();
    let mut rewritten = message.clone();
    rewritten.content = Content::Text(re.replace_all(&text, "[tool-call-reference]").into_owned());
    rewritten
}

/// Maps a `reqwest` transport failure or an HTTP error status into the
/// closed provider-error taxonomy (§4.5.5, §7).
pub fn map_http_error(status: Option<reqwest::StatusCode>, body: &str) -> PenguinError {
    match status {
        Some(s) if s.as_u16() == 401 || s.as_u16() == 403 => PenguinError::Auth(body.to_string()),
        Some(s) if s.as_u16() == 429 => PenguinError::RateLimit(body.to_string()),
        Some(s) if s.as_u16() == 400 => PenguinError::InvalidRequest(body.to_string()),
        Some(s) if s.as_u16() == 413 => PenguinError::ContextLengthExceeded { used: 0, limit: 0 },
        Some(s) => PenguinError::Provider(format!("http {s}: {body}")),
        None => PenguinError::Provider(body.to_string()),
    }
}

/// Decodes an SSE byte stream into raw `data:` payload strings, skipping
/// heartbeats, comments, and the `[DONE]` sentinel.
pub fn decode_sse(
    response: reqwest::Response,
) -> Pin<Box<dyn Stream<Item = Result<String>> + Send>> {
    use futures::StreamExt;

    let stream = response.bytes_stream().filter_map(move |chunk| async move {
        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => return Some(Err(PenguinError::Network(e))),
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();
        for line in text.lines() {
            if let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")) {
                let data = data.trim();
                if data == "[DONE]" || data.is_empty() {
                    continue;
                }
                return Some(Ok(data.to_string()));
            }
        }
        None
    });

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::message::MessageCategory;

    #[test]
    fn system_message_is_hoisted_when_supported() {
        let messages = vec![Message::system("be helpful"), Message::user("hi")];
        let (system, rest) = format_messages(&messages, true);
        assert_eq!(system.as_deref(), Some("be helpful"));
        assert_eq!(rest.len(), 1);
    }

    #[test]
    fn orphan_tool_message_is_rewritten_to_assistant() {
        let messages = vec![Message::tool_result("result text", None)];
        let sanitized = sanitize_tool_messages(&messages);
        assert_eq!(sanitized[0].role, Role::Assistant);
        assert!(sanitized[0].content.as_text().starts_with("[Tool Result]"));
    }

    #[test]
    fn tool_message_with_matching_call_is_preserved() {
        let mut assistant = Message::assistant("calling a tool");
        assistant.metadata = serde_json::json!({ "tool_calls": [{"id": "call_1"}] });
        let tool = Message::tool_result("42", Some("call_1".into()));
        let sanitized = sanitize_tool_messages(&[assistant, tool]);
        assert_eq!(sanitized[1].role, Role::Tool);
    }

    #[test]
    fn orphan_tool_call_id_reference_in_text_is_redacted() {
        let mut message = Message::user("see tool_call_id: abc123 for details");
        message.category = MessageCategory::Dialog;
        let sanitized = sanitize_tool_messages(&[message]);
        assert!(sanitized[0].content.as_text().contains("[tool-call-reference]"));
    }

    #[test]
    fn rate_limit_status_maps_to_rate_limit_error() {
        let err = map_http_error(Some(reqwest::StatusCode::TOO_MANY_REQUESTS), "slow down");
        assert!(matches!(err, PenguinError::RateLimit(_)));
    }
}

//! LiteLLM adapter: fallback client preference for providers with no native
//! or OpenRouter-specific handling. Talks the same OpenAI-compatible
//! chat-completions wire format as [`super::openrouter`] against a
//! self-hosted or third-party LiteLLM proxy base URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::openrouter::stream_chat_response;
use super::{
    format_messages, map_http_error, publish_stream_end, ChunkSink, Gateway, GatewayOptions,
    GatewayResponse, TokenUsage,
};
use crate::conversation::message::{Message, Role};
use crate::error::{PenguinError, Result};
use crate::event::EventBus;
use crate::model::{ModelSpec, ReasoningEffort, ReasoningStyle};

const DEFAULT_BASE_URL: &str = "http://localhost:4000";

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    effort: Option<ReasoningEffort>,
}

/// Effort-style reasoning models (o1/o3/gpt-5) take `{effort: <level>}`
/// instead of `temperature` (§4.5.2).
fn effort_param(model: &ModelSpec) -> Option<ReasoningEffort> {
    match &model.reasoning_style {
        ReasoningStyle::Effort { effort } => Some(*effort),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

pub struct LiteLlmGateway {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl LiteLlmGateway {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(PenguinError::Network)?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[async_trait]
impl Gateway for LiteLlmGateway {
    fn provider(&self) -> &str {
        "litellm"
    }

    async fn get_response(
        &self,
        model: &ModelSpec,
        messages: &[Message],
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: tokio_util::sync::CancellationToken,
        bus: Option<&EventBus>,
    ) -> Result<GatewayResponse> {
        let (_, flattened) = format_messages(messages, false);
        let wire_messages = flattened
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role).to_string(),
                content: m.content.as_text(),
            })
            .collect();

        let effort = effort_param(model);
        let temperature = if effort.is_some() { None } else { options.temperature };

        let request = ChatRequest {
            model: model.model_id.clone(),
            messages: wire_messages,
            max_tokens: options.max_output_tokens,
            temperature,
            stream: Some(options.stream),
            effort,
        };

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(PenguinError::Network)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(map_http_error(Some(status), &body));
        }

        let result = if options.stream {
            stream_chat_response(response, sink, cancel).await?
        } else {
            let parsed: ChatResponse = response.json().await.map_err(PenguinError::Network)?;
            let text = parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default();
            GatewayResponse {
                text,
                reasoning_text: None,
                usage: parsed.usage.map(|u| TokenUsage {
                    input_tokens: u.prompt_tokens,
                    output_tokens: u.completion_tokens,
                }),
            }
        };

        publish_stream_end(bus, self.provider(), &result).await;
        Ok(result)
    }
}

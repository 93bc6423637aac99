//! OpenRouter adapter: OpenAI-compatible chat-completions wire format,
//! including its chunked SSE streaming shape.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    decode_sse, format_messages, map_http_error, publish_stream_end, ChunkSink, ChunkTag, Gateway,
    GatewayOptions, GatewayResponse, StreamChunk, TokenUsage,
};
use crate::conversation::message::Message;
use crate::error::{PenguinError, Result};
use crate::event::EventBus;
use crate::model::{ModelSpec, ReasoningEffort, ReasoningStyle};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

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

#[derive(Debug, Deserialize)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
}

pub struct OpenRouterGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenRouterGateway {
    pub fn new(api_key: String, base_url: Option<String>) -> Result<Self> {
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

    fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
        // OpenRouter accepts an inline system role, so no hoisting here.
        let (_, flattened) = format_messages(messages, false);
        flattened
            .iter()
            .map(|m| WireMessage {
                role: role_str(m.role).to_string(),
                content: m.content.as_text(),
            })
            .collect()
    }
}

fn role_str(role: crate::conversation::message::Role) -> &'static str {
    use crate::conversation::message::Role;
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[async_trait]
impl Gateway for OpenRouterGateway {
    fn provider(&self) -> &str {
        "openrouter"
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
        let effort = effort_param(model);
        let temperature = if effort.is_some() { None } else { options.temperature };

        let request = ChatRequest {
            model: model.model_id.clone(),
            messages: Self::to_wire_messages(messages),
            max_tokens: options.max_output_tokens,
            temperature,
            stream: Some(options.stream),
            effort,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(PenguinError::Network)?;

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

/// Shared by OpenRouter and LiteLLM: both speak the OpenAI chat-completions
/// chunk shape over SSE.
pub(super) async fn stream_chat_response(
    response: reqwest::Response,
    sink: Option<Arc<dyn ChunkSink>>,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<GatewayResponse> {
    let mut text = String::new();
    let mut reasoning_text = String::new();
    let mut usage = None;
    let mut stream = decode_sse(response);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            item = stream.next() => item,
        };
        let Some(item) = next else { break };
        let payload = item?;
        let chunk: ChatChunk = match serde_json::from_str(&payload) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "skipping unparseable chat chunk");
                continue;
            }
        };
        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(reasoning) = choice.delta.reasoning {
                reasoning_text.push_str(&reasoning);
                if let Some(sink) = &sink {
                    sink.on_chunk(StreamChunk {
                        tag: ChunkTag::Reasoning,
                        text: reasoning,
                    })
                    .await;
                }
            }
            if let Some(content) = choice.delta.content {
                text.push_str(&content);
                if let Some(sink) = &sink {
                    sink.on_chunk(StreamChunk {
                        tag: ChunkTag::Assistant,
                        text: content,
                    })
                    .await;
                }
            }
        }
        if let Some(u) = chunk.usage {
            usage = Some(TokenUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            });
        }
    }

    Ok(GatewayResponse {
        text,
        reasoning_text: (!reasoning_text.is_empty()).then_some(reasoning_text),
        usage,
    })
}

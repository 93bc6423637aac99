//! Native Anthropic adapter: direct Messages API access (same endpoint,
//! headers, and request/response shapes as Anthropic's HTTP API), extended
//! with SSE streaming and the uniform [`Gateway`] contract.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::{
    decode_sse, format_messages, map_http_error, publish_stream_end, ChunkSink, ChunkTag, Gateway,
    GatewayOptions, GatewayResponse, StreamChunk, TokenUsage,
};
use crate::conversation::message::Message;
use crate::error::{PenguinError, Result};
use crate::event::EventBus;
use crate::model::{ModelSpec, ReasoningStyle};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    MessageDelta { usage: Option<AnthropicUsage> },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

pub struct NativeAnthropicGateway {
    client: Client,
    api_key: String,
    base_url: String,
}

impl NativeAnthropicGateway {
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

    fn reasoning_param(model: &ModelSpec) -> Option<serde_json::Value> {
        match &model.reasoning_style {
            ReasoningStyle::MaxTokens { reasoning_max_tokens } => Some(json!({
                "type": "enabled",
                "budget_tokens": reasoning_max_tokens,
            })),
            ReasoningStyle::Effort { .. } | ReasoningStyle::None => None,
        }
    }
}

#[async_trait]
impl Gateway for NativeAnthropicGateway {
    fn provider(&self) -> &str {
        "anthropic"
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
        let (system, rest) = format_messages(messages, true);
        let wire_messages = rest
            .iter()
            .map(|m| WireMessage {
                role: match m.role {
                    crate::conversation::message::Role::Assistant => "assistant".to_string(),
                    _ => "user".to_string(),
                },
                content: m.content.as_text(),
            })
            .collect();

        // Never submit both temperature and effort/max_tokens reasoning at once (§4.5.2).
        let thinking = Self::reasoning_param(model);
        let temperature = if thinking.is_some() { None } else { options.temperature };

        let request = AnthropicRequest {
            model: model.model_id.clone(),
            messages: wire_messages,
            max_tokens: options.max_output_tokens,
            temperature,
            system,
            stream: Some(options.stream),
            thinking,
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("content-type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
            self.stream_response(response, sink, cancel).await?
        } else {
            let parsed: AnthropicResponse = response.json().await.map_err(PenguinError::Network)?;
            let mut text = String::new();
            let mut reasoning_text = String::new();
            for block in parsed.content {
                match block.kind.as_str() {
                    "text" => text.push_str(&block.text),
                    "thinking" => {
                        if let Some(t) = block.thinking {
                            reasoning_text.push_str(&t);
                        }
                    }
                    _ => {}
                }
            }
            GatewayResponse {
                text,
                reasoning_text: (!reasoning_text.is_empty()).then_some(reasoning_text),
                usage: parsed.usage.map(|u| TokenUsage {
                    input_tokens: u.input_tokens,
                    output_tokens: u.output_tokens,
                }),
            }
        };

        publish_stream_end(bus, self.provider(), &result).await;
        Ok(result)
    }
}

impl NativeAnthropicGateway {
    async fn stream_response(
        &self,
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
            let event: StreamEvent = match serde_json::from_str(&payload) {
                Ok(e) => e,
                Err(e) => {
                    debug!(error = %e, "skipping unparseable stream event");
                    continue;
                }
            };
            match event {
                StreamEvent::ContentBlockDelta { delta } => match delta {
                    Delta::TextDelta { text: chunk } => {
                        text.push_str(&chunk);
                        if let Some(sink) = &sink {
                            sink.on_chunk(StreamChunk {
                                tag: ChunkTag::Assistant,
                                text: chunk,
                            })
                            .await;
                        }
                    }
                    Delta::ThinkingDelta { thinking: chunk } => {
                        reasoning_text.push_str(&chunk);
                        if let Some(sink) = &sink {
                            sink.on_chunk(StreamChunk {
                                tag: ChunkTag::Reasoning,
                                text: chunk,
                            })
                            .await;
                        }
                    }
                    Delta::Other => {}
                },
                StreamEvent::MessageDelta { usage: u } => {
                    if let Some(u) = u {
                        usage = Some(TokenUsage {
                            input_tokens: u.input_tokens,
                            output_tokens: u.output_tokens,
                        });
                    }
                }
                StreamEvent::Other => {}
            }
        }

        Ok(GatewayResponse {
            text,
            reasoning_text: (!reasoning_text.is_empty()).then_some(reasoning_text),
            usage,
        })
    }
}

//! Engine (C10): the run loop. One gateway call + action dispatch + result
//! append per step; multi-step tasks loop until a stop condition; continuous
//! mode drops the sentinel-driven exit for a wall-clock limit.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::action::ActionParser;
use crate::conversation::manager::ConversationManager;
use crate::conversation::message::{MessageCategory, Role};
use crate::error::{PenguinError, Result};
use crate::event::{EventBus, EventType, Priority};
use crate::gateway::{ChunkSink, Gateway, GatewayOptions};
use crate::model::ModelSpec;
use crate::tools::{ToolRegistry, ToolResult};

pub const DEFAULT_COMPLETION_SENTINEL: &str = "TASK_COMPLETED";
pub const DEFAULT_CLARIFICATION_SENTINEL: &str = "NEED_USER_CLARIFICATION";
const DEFAULT_MAX_ITERATIONS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    Idle,
    Running,
    WaitingForTool,
    Done,
    Failed,
    Interrupted,
    NeedsInput,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_iterations: u32,
    pub completion_sentinel: String,
    pub clarification_sentinel: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            completion_sentinel: DEFAULT_COMPLETION_SENTINEL.to_string(),
            clarification_sentinel: DEFAULT_CLARIFICATION_SENTINEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub assistant_response: String,
    #[serde(skip)]
    pub action_results: Vec<ToolResult>,
    pub iterations: u32,
    pub state: EngineState,
}

pub struct Engine {
    gateway: Arc<dyn Gateway>,
    tools: Arc<ToolRegistry>,
    parser: Arc<ActionParser>,
    bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        tools: Arc<ToolRegistry>,
        parser: Arc<ActionParser>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            gateway,
            tools,
            parser,
            bus,
            config,
        }
    }

    /// One gateway call + action dispatch + result append.
    pub async fn single_step(
        &self,
        conversation: &mut ConversationManager,
        model: &ModelSpec,
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: CancellationToken,
    ) -> Result<(String, Vec<ToolResult>)> {
        let response = self
            .call_with_retry(conversation, model, options, sink, cancel)
            .await?;

        conversation
            .add_message(Role::Assistant, response.text.clone(), MessageCategory::Dialog, Some(&self.bus))
            .await?;
        if let Some(reasoning) = &response.reasoning_text {
            if !reasoning.is_empty() {
                conversation
                    .add_message(Role::Assistant, reasoning.clone(), MessageCategory::Reasoning, Some(&self.bus))
                    .await?;
            }
        }

        let outcome = self.parser.parse(&response.text);
        let mut results = Vec::with_capacity(outcome.actions.len());
        for action in &outcome.actions {
            self.bus
                .publish(
                    EventType::ToolCall,
                    serde_json::json!({ "action": action.name }),
                    Priority::Normal,
                )
                .await;
            let result = self.tools.dispatch(action, Some(&self.bus)).await;
            conversation
                .add_message(
                    Role::Tool,
                    result.result.clone(),
                    MessageCategory::ToolResult,
                    Some(&self.bus),
                )
                .await?;
            results.push(result);
        }

        Ok((response.text, results))
    }

    async fn call_with_retry(
        &self,
        conversation: &ConversationManager,
        model: &ModelSpec,
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: CancellationToken,
    ) -> Result<crate::gateway::GatewayResponse> {
        // Pre-flight stop condition (§4.10): refuse the call outright if the
        // current history plus the requested completion would blow the
        // model's context window, instead of waiting for the provider to
        // reject it.
        let usage = conversation.get_token_usage();
        if usage.current_total + options.max_output_tokens > model.max_context_window_tokens {
            return Err(PenguinError::ContextLengthExceeded {
                used: usage.current_total as usize,
                limit: model.max_context_window_tokens as usize,
            });
        }

        let mut attempt = 0;
        loop {
            let messages = conversation.get_history().to_vec();
            let call = self
                .gateway
                .get_response(model, &messages, options, sink.clone(), cancel.clone(), Some(&self.bus))
                .await;
            match call {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() && attempt < err.max_retries() => {
                    attempt += 1;
                    let jitter = rand::rng().random_range(0.8..1.2);
                    let backoff = RETRY_BASE.mul_f64(2f64.powi(attempt as i32 - 1) * jitter);
                    warn!(attempt, error = %err, "retrying gateway call after backoff");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Loops `single_step` up to `max_iterations`, honoring the stop
    /// conditions in §4.10.
    pub async fn run_task(
        &self,
        conversation: &mut ConversationManager,
        model: &ModelSpec,
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: CancellationToken,
        max_iterations: Option<u32>,
    ) -> Result<StepOutcome> {
        let max_iterations = max_iterations.unwrap_or(self.config.max_iterations);
        self.bus
            .publish(EventType::TaskStarted, serde_json::json!({}), Priority::Normal)
            .await;

        let mut last_response = String::new();
        let mut iteration = 0u32;

        loop {
            if cancel.is_cancelled() {
                self.bus
                    .publish(EventType::TaskFailed, serde_json::json!({ "reason": "interrupted" }), Priority::High)
                    .await;
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: Vec::new(),
                    iterations: iteration,
                    state: EngineState::Interrupted,
                });
            }

            iteration += 1;
            let (response, results) = match self
                .single_step(conversation, model, options, sink.clone(), cancel.clone())
                .await
            {
                Ok(pair) => pair,
                Err(err) => {
                    self.bus
                        .publish(
                            EventType::TaskFailed,
                            serde_json::json!({ "error": err.kind() }),
                            Priority::High,
                        )
                        .await;
                    return Err(err);
                }
            };
            last_response = response.clone();

            self.bus
                .publish(
                    EventType::TaskProgressed,
                    serde_json::json!({
                        "iteration": iteration,
                        "max_iterations": max_iterations,
                        "progress_percent": (100 * iteration / max_iterations).min(100),
                    }),
                    Priority::Normal,
                )
                .await;

            if response.contains(&self.config.completion_sentinel) {
                info!(iteration, "task completed via sentinel");
                self.bus
                    .publish(
                        EventType::TaskCompleted,
                        serde_json::json!({ "response": response }),
                        Priority::Normal,
                    )
                    .await;
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: results,
                    iterations: iteration,
                    state: EngineState::Done,
                });
            }

            if response.contains(&self.config.clarification_sentinel) {
                self.bus
                    .publish(EventType::TaskNeedsInput, serde_json::json!({}), Priority::Normal)
                    .await;
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: results,
                    iterations: iteration,
                    state: EngineState::NeedsInput,
                });
            }

            if results.is_empty() && iteration >= 2 {
                self.bus
                    .publish(
                        EventType::TaskCompleted,
                        serde_json::json!({ "response": response, "reason": "no_actions" }),
                        Priority::Normal,
                    )
                    .await;
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: results,
                    iterations: iteration,
                    state: EngineState::Done,
                });
            }

            if iteration >= max_iterations {
                self.bus
                    .publish(
                        EventType::TaskCompleted,
                        serde_json::json!({ "response": response, "reason": "max_iterations" }),
                        Priority::Normal,
                    )
                    .await;
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: results,
                    iterations: iteration,
                    state: EngineState::Done,
                });
            }
        }
    }

    /// Like `run_task` but without a sentinel-driven exit: stops on a wall
    /// clock limit or explicit cancellation, checked cooperatively between
    /// iterations (§4.10 "continuous mode").
    pub async fn run_continuous(
        &self,
        conversation: &mut ConversationManager,
        model: &ModelSpec,
        options: &GatewayOptions,
        sink: Option<Arc<dyn ChunkSink>>,
        cancel: CancellationToken,
        time_limit: Duration,
    ) -> Result<StepOutcome> {
        let deadline = tokio::time::Instant::now() + time_limit;
        let mut last_response = String::new();
        let mut iteration = 0u32;

        loop {
            if cancel.is_cancelled() || tokio::time::Instant::now() >= deadline {
                return Ok(StepOutcome {
                    assistant_response: last_response,
                    action_results: Vec::new(),
                    iterations: iteration,
                    state: if cancel.is_cancelled() {
                        EngineState::Interrupted
                    } else {
                        EngineState::Done
                    },
                });
            }
            iteration += 1;
            let (response, results) = self
                .single_step(conversation, model, options, sink.clone(), cancel.clone())
                .await?;
            last_response = response;
            let _ = results;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionParserConfig;
    use crate::config::PenguinConfig;
    use crate::conversation::message::Message;
    use crate::model::ModelRegistry;
    use crate::session::FileSessionStore;
    use crate::tools::RootPolicy;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct StubGateway {
        response: String,
    }

    #[async_trait]
    impl Gateway for StubGateway {
        fn provider(&self) -> &str {
            "stub"
        }

        async fn get_response(
            &self,
            _model: &ModelSpec,
            _messages: &[Message],
            _options: &GatewayOptions,
            _sink: Option<Arc<dyn ChunkSink>>,
            _cancel: CancellationToken,
            _bus: Option<&EventBus>,
        ) -> Result<crate::gateway::GatewayResponse> {
            Ok(crate::gateway::GatewayResponse {
                text: self.response.clone(),
                reasoning_text: None,
                usage: None,
            })
        }
    }

    fn engine(response: &str) -> (Engine, ConversationManager, ModelSpec) {
        let registry = ModelRegistry::new(PenguinConfig::default());
        let model = registry.resolve("anthropic/claude-sonnet-4").unwrap();
        let dir = tempdir().unwrap();
        let conversation = ConversationManager::new("agent-1", &model, FileSessionStore::new(dir.path()));
        let roots = RootPolicy::new(dir.path().to_path_buf(), dir.path().to_path_buf());
        let tools = Arc::new(ToolRegistry::new(roots));
        let parser = Arc::new(ActionParser::new(ActionParserConfig::new(vec!["execute".into()])));
        let bus = Arc::new(EventBus::new());
        let gateway = Arc::new(StubGateway {
            response: response.to_string(),
        });
        (
            Engine::new(gateway, tools, parser, bus, EngineConfig::default()),
            conversation,
            model,
        )
    }

    #[tokio::test]
    async fn task_completes_on_sentinel() {
        let (engine, mut conversation, model) = engine("all done. TASK_COMPLETED");
        let outcome = engine
            .run_task(
                &mut conversation,
                &model,
                &GatewayOptions::default(),
                None,
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.state, EngineState::Done);
        assert_eq!(outcome.iterations, 1);
    }

    #[tokio::test]
    async fn task_stops_after_max_iterations_with_no_sentinel() {
        let (engine, mut conversation, model) = engine("still working, no actions here");
        let outcome = engine
            .run_task(
                &mut conversation,
                &model,
                &GatewayOptions::default(),
                None,
                CancellationToken::new(),
                Some(3),
            )
            .await
            .unwrap();
        // no actions parsed and iteration >= 2 stops the loop early.
        assert_eq!(outcome.state, EngineState::Done);
        assert!(outcome.iterations <= 3);
    }

    #[tokio::test]
    async fn needs_clarification_sentinel_pauses_the_task() {
        let (engine, mut conversation, model) = engine("NEED_USER_CLARIFICATION please specify");
        let outcome = engine
            .run_task(
                &mut conversation,
                &model,
                &GatewayOptions::default(),
                None,
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.state, EngineState::NeedsInput);
    }

    #[tokio::test]
    async fn cancelled_token_interrupts_before_first_step() {
        let (engine, mut conversation, model) = engine("TASK_COMPLETED");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = engine
            .run_task(&mut conversation, &model, &GatewayOptions::default(), None, cancel, None)
            .await
            .unwrap();
        assert_eq!(outcome.state, EngineState::Interrupted);
        assert_eq!(outcome.iterations, 0);
    }
}

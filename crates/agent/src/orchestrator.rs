//! The orchestration loop: ask the model, execute requested tools, feed
//! the results back, repeat.
//!
//! ```text
//! AwaitingModelResponse ──no tool calls──▶ Complete
//!        │ tool calls
//!        ▼
//!  ExecutingTools ──▶ AwaitingModelResponse   (at most max_iterations rounds)
//!        │ budget exhausted
//!        ▼
//!  ForcedFinalCall (tools disabled) ──▶ Complete
//! ```
//!
//! Any fatal error (retries exhausted, recursion limit, cancellation,
//! deadline) ends the run immediately. Blocking and streaming runs share
//! this one implementation; streaming only swaps in a live [`Emitter`].

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use toolweave_config::OrchestratorConfig;
use toolweave_core::{
    Conversation, ConversationMemory, ExecutionSummary, InvocationContext, Message,
    MessageFilter, NoopTracer, Provider, ProviderRequest, Result, Role, ToolCallRequest,
    ToolDefinition, ToolRegistry, TraceEvent, Tracer, Usage,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{ToolDispatcher, record_result};
use crate::guard::RepetitionGuard;
use crate::retry::retry_with_backoff;
use crate::stream::{Emitter, consume_chunks, fallback_call_id};

/// Context value carrying the id of the run that dispatched a tool.
pub const RUN_ID_KEY: &str = "toolweave.run_id";
/// Context value carrying the name of the agent that dispatched a tool.
pub const AGENT_KEY: &str = "toolweave.agent";

/// Result of a completed run.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    /// The final answer text.
    pub answer: String,
    pub summary: ExecutionSummary,
    /// Full history as sent to the model, ending with the final answer.
    pub messages: Vec<Message>,
    /// Whether the answer came from the tools-disabled final call.
    pub forced_final: bool,
}

/// One model call's response, whichever way it arrived.
struct ModelTurn {
    content: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    model: String,
}

/// Per-run mutable state. Owned by exactly one run.
struct RunState {
    run_id: String,
    conversation: Conversation,
    summary: ExecutionSummary,
}

/// Drives a model through tool-calling rounds until it answers.
///
/// Cheap to clone; all collaborators are shared.
#[derive(Clone)]
pub struct Orchestrator {
    pub(crate) name: String,
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) config: Arc<OrchestratorConfig>,
    pub(crate) memory: Option<Arc<dyn ConversationMemory>>,
    pub(crate) tracer: Arc<dyn Tracer>,
}

impl Orchestrator {
    /// Create an orchestrator. The agent name comes from `config.agent.name`.
    pub fn new(provider: Arc<dyn Provider>, tools: ToolRegistry, config: OrchestratorConfig) -> Self {
        Self {
            name: config.agent.name.clone(),
            provider,
            tools: Arc::new(tools),
            config: Arc::new(config),
            memory: None,
            tracer: Arc::new(NoopTracer),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach a memory collaborator for seeding and persisting turns.
    pub fn with_memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Attach a tracer (e.g. a `TelemetryEngine` or an `EventBus`).
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.config).agent.system_prompt = Some(prompt.into());
        self
    }

    /// Set max tool rounds. Zero is treated as one.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        Arc::make_mut(&mut self.config).agent.max_iterations = max.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn tracer(&self) -> Arc<dyn Tracer> {
        self.tracer.clone()
    }

    /// Run to completion and return the final answer.
    pub async fn run(&self, prompt: &str, ctx: &InvocationContext) -> Result<RunOutput> {
        self.execute(prompt, ctx, &mut Emitter::disabled()).await
    }

    /// The single loop behind both `run` and `run_stream`.
    pub(crate) async fn execute(
        &self,
        prompt: &str,
        ctx: &InvocationContext,
        emitter: &mut Emitter,
    ) -> Result<RunOutput> {
        let started = Instant::now();
        let mut state = RunState {
            run_id: Uuid::new_v4().to_string(),
            conversation: Conversation::new(),
            summary: ExecutionSummary::default(),
        };
        let depth = ctx.recursion().depth;

        info!(
            agent = %self.name,
            run_id = %state.run_id,
            depth,
            streaming = emitter.is_streaming(),
            max_iterations = self.config.agent.max_iterations,
            "Run starting"
        );
        self.tracer.record(TraceEvent::RunStarted {
            run_id: state.run_id.clone(),
            agent: self.name.clone(),
            depth,
            timestamp: Utc::now(),
        });

        let outcome = self.drive(prompt, ctx, emitter, &mut state).await;
        state.summary.execution_time = started.elapsed();

        self.tracer.record(TraceEvent::RunFinished {
            run_id: state.run_id.clone(),
            success: outcome.is_ok(),
            summary: state.summary.clone(),
            timestamp: Utc::now(),
        });

        match outcome {
            Ok((answer, forced_final)) => {
                info!(
                    agent = %self.name,
                    run_id = %state.run_id,
                    llm_calls = state.summary.llm_calls,
                    tool_calls = state.summary.tool_calls,
                    sub_agent_calls = state.summary.sub_agent_calls,
                    forced_final,
                    elapsed_ms = state.summary.execution_time.as_millis() as u64,
                    "Run completed"
                );
                Ok(RunOutput {
                    answer,
                    summary: state.summary,
                    messages: state.conversation.messages,
                    forced_final,
                })
            }
            Err(err) => {
                warn!(
                    agent = %self.name,
                    run_id = %state.run_id,
                    kind = err.kind(),
                    "Run failed: {err}"
                );
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        prompt: &str,
        ctx: &InvocationContext,
        emitter: &mut Emitter,
        state: &mut RunState,
    ) -> Result<(String, bool)> {
        ctx.check()?;
        state.conversation = Conversation::with_messages(self.seed(prompt).await);
        self.persist(Message::user(prompt)).await;

        let dispatcher = ToolDispatcher::new(
            self.tools.clone(),
            RepetitionGuard::new(self.config.tools.repetition_threshold),
            self.tracer.clone(),
            state.run_id.clone(),
        )
        .with_memory(self.memory.clone())
        .with_tool_timeout(self.config.tools.tool_timeout());
        let definitions = dispatcher.definitions();

        let tool_ctx = ctx
            .clone()
            .with_value(RUN_ID_KEY, serde_json::Value::String(state.run_id.clone()))
            .with_value(AGENT_KEY, serde_json::Value::String(self.name.clone()));
        let tool_ctx = match emitter.forwarder() {
            Some(forwarder) => tool_ctx.with_forwarder(forwarder),
            None => tool_ctx.without_forwarder(),
        };

        let max_iterations = self.config.agent.max_iterations.max(1);
        for iteration in 1..=max_iterations {
            ctx.check()?;
            debug!(agent = %self.name, iteration, "Iteration starting");

            let turn = self
                .call_model(state, definitions.clone(), ctx, emitter, iteration, false)
                .await?;

            if turn.tool_calls.is_empty() {
                emitter.end_final_round().await?;
                return Ok((self.complete(state, turn.content).await, false));
            }

            emitter.end_tool_round().await?;
            debug!(
                agent = %self.name,
                iteration,
                tool_calls = turn.tool_calls.len(),
                "Model requested tools"
            );

            let calls = turn.tool_calls.clone();
            state
                .conversation
                .push(Message::assistant_with_tools(turn.content, turn.tool_calls));

            // Serial, in call order; results land in history in the same order.
            for call in &calls {
                let result = tokio::select! {
                    biased;
                    err = ctx.cancelled() => return Err(err),
                    result = dispatcher.dispatch(call, &tool_ctx) => result?,
                };
                record_result(&mut state.summary, &result);
                emitter.tool_result(call, &result).await?;
                state.conversation.push(result.to_message());
            }
        }

        warn!(
            agent = %self.name,
            max_iterations,
            "Iteration budget exhausted, forcing a final answer"
        );
        ctx.check()?;
        state
            .conversation
            .push(Message::user(&self.config.agent.final_instruction));

        let turn = self
            .call_model(state, Vec::new(), ctx, emitter, max_iterations + 1, true)
            .await?;
        if !turn.tool_calls.is_empty() {
            debug!(
                agent = %self.name,
                ignored = turn.tool_calls.len(),
                "Ignoring tool calls in forced final response"
            );
        }
        emitter.end_final_round().await?;
        Ok((self.complete(state, turn.content).await, true))
    }

    async fn complete(&self, state: &mut RunState, answer: String) -> String {
        let message = Message::assistant(&answer);
        state.conversation.push(message.clone());
        self.persist(message).await;
        answer
    }

    /// System prompt, then recent history from memory, then the prompt.
    async fn seed(&self, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::new();
        if let Some(system) = &self.config.agent.system_prompt {
            messages.push(Message::system(system));
        }

        if let Some(memory) = &self.memory {
            let filter = MessageFilter::recent(self.config.agent.history_limit)
                .with_roles([Role::User, Role::Assistant, Role::Tool]);
            match memory.get_messages(&filter).await {
                Ok(mut history) => {
                    // A cut through a tool round can leave orphaned results at the front.
                    let orphans = history
                        .iter()
                        .take_while(|m| m.role == Role::Tool)
                        .count();
                    let history = history.split_off(orphans);
                    debug!(agent = %self.name, seeded = history.len(), "Seeded history from memory");
                    messages.extend(history);
                }
                Err(e) => warn!(agent = %self.name, "Memory read failed, starting fresh: {e}"),
            }
        }

        messages.push(Message::user(prompt));
        messages
    }

    async fn persist(&self, message: Message) {
        if let Some(memory) = &self.memory
            && let Err(e) = memory.add_message(message).await
        {
            warn!(agent = %self.name, "Failed to persist message to memory: {e}");
        }
    }

    fn request(&self, state: &RunState, tools: Vec<ToolDefinition>, stream: bool) -> ProviderRequest {
        ProviderRequest {
            model: self.config.agent.model.clone(),
            messages: state.conversation.messages.clone(),
            temperature: self.config.agent.temperature,
            max_tokens: self.config.agent.max_tokens,
            tools,
            stream,
        }
    }

    async fn call_model(
        &self,
        state: &mut RunState,
        tools: Vec<ToolDefinition>,
        ctx: &InvocationContext,
        emitter: &mut Emitter,
        iteration: u32,
        forced_final: bool,
    ) -> Result<ModelTurn> {
        let streaming = emitter.is_streaming();
        let request = self.request(state, tools, streaming);
        let id_prefix = call_id_prefix(&state.run_id, iteration);
        let started = Instant::now();

        let outcome = if streaming {
            self.stream_model(request, ctx, emitter, !forced_final, &id_prefix)
                .await
        } else {
            self.complete_model(request, ctx).await
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        self.tracer.record(TraceEvent::ModelCall {
            run_id: state.run_id.clone(),
            model: match &outcome {
                Ok(turn) => turn.model.clone(),
                Err(_) => self.config.agent.model.clone(),
            },
            iteration,
            forced_final,
            success: outcome.is_ok(),
            duration_ms,
            usage: outcome.as_ref().ok().and_then(|t| t.usage),
            timestamp: Utc::now(),
        });

        let mut turn = outcome?;
        for (index, call) in turn.tool_calls.iter_mut().enumerate() {
            if call.id.trim().is_empty() {
                call.id = fallback_call_id(&id_prefix, index);
            }
        }
        state.summary.record_llm_call(turn.usage.as_ref());
        debug!(
            agent = %self.name,
            iteration,
            forced_final,
            duration_ms,
            content_len = turn.content.len(),
            tool_calls = turn.tool_calls.len(),
            "Model call finished"
        );
        Ok(turn)
    }

    async fn complete_model(
        &self,
        request: ProviderRequest,
        ctx: &InvocationContext,
    ) -> Result<ModelTurn> {
        let response = retry_with_backoff(&self.config.retry, ctx, &self.name, || {
            let provider = self.provider.clone();
            let request = request.clone();
            async move { provider.complete(request).await }
        })
        .await?;

        Ok(ModelTurn {
            content: response.message.content,
            tool_calls: response.message.tool_calls,
            usage: response.usage,
            model: response.model,
        })
    }

    /// Retries cover opening the stream; a stream that fails midway is fatal.
    async fn stream_model(
        &self,
        request: ProviderRequest,
        ctx: &InvocationContext,
        emitter: &mut Emitter,
        announce_tools: bool,
        id_prefix: &str,
    ) -> Result<ModelTurn> {
        let model = request.model.clone();
        let chunks = retry_with_backoff(&self.config.retry, ctx, &self.name, || {
            let provider = self.provider.clone();
            let request = request.clone();
            async move { provider.stream(request).await }
        })
        .await?;

        let turn = consume_chunks(chunks, ctx, emitter, announce_tools, id_prefix).await?;
        Ok(ModelTurn {
            content: turn.content,
            tool_calls: turn.tool_calls,
            usage: turn.usage,
            model,
        })
    }
}

/// `call_<run>_<iteration>`: scopes fallback tool-call ids to one model call
/// of one run, so they stay unique in seeded histories too.
fn call_id_prefix(run_id: &str, iteration: u32) -> String {
    let run = run_id.split('-').next().unwrap_or(run_id);
    format!("call_{run}_{iteration}")
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("name", &self.name)
            .field("provider", &self.provider.name())
            .field("tools", &self.tools)
            .field("max_iterations", &self.config.agent.max_iterations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{
        EchoTool, FailingTool, SequentialMockProvider, SlowTool, make_text_response,
        make_tool_call, make_tool_call_response, make_tool_call_with_id,
    };
    use serde_json::json;
    use std::time::Duration;
    use toolweave_core::{Error, ProviderError, StreamEvent, StreamEventType};
    use toolweave_memory::InMemoryHistory;
    use toolweave_telemetry::TelemetryEngine;

    fn orchestrator(provider: Arc<SequentialMockProvider>) -> Orchestrator {
        Orchestrator::new(
            provider,
            ToolRegistry::new().with(EchoTool).with(FailingTool {
                reason: "disk full".into(),
            }),
            OrchestratorConfig::default(),
        )
    }

    fn echo_round(text: &str) -> toolweave_core::ProviderResponse {
        make_tool_call_response(vec![make_tool_call("echo", json!({ "text": text }))], "")
    }

    fn fast_retries(mut config: OrchestratorConfig) -> OrchestratorConfig {
        config.retry.initial_backoff_ms = 10;
        config.retry.max_backoff_ms = 40;
        config
    }

    #[tokio::test]
    async fn text_only_response_needs_one_call() {
        let provider = Arc::new(SequentialMockProvider::single_text("Hello!"));
        let out = orchestrator(provider.clone())
            .run("hi", &InvocationContext::new())
            .await
            .unwrap();

        assert_eq!(out.answer, "Hello!");
        assert!(!out.forced_final);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(out.summary.llm_calls, 1);
        assert_eq!(out.summary.tool_calls, 0);
        assert_eq!(out.summary.usage.total_tokens, 15);
    }

    #[tokio::test]
    async fn tool_round_then_answer() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            echo_round("pong"),
            make_text_response("The tool said pong"),
        ]));
        let out = orchestrator(provider.clone())
            .run("ping", &InvocationContext::new())
            .await
            .unwrap();

        assert_eq!(out.answer, "The tool said pong");
        assert_eq!(provider.call_count(), 2);
        assert_eq!(out.summary.tool_calls, 1);
        assert_eq!(out.summary.used_tools, vec!["echo"]);

        // The second request saw the tool result.
        let second = &provider.requests()[1];
        let tool_msg = second.messages.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.content, "pong");
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_echo"));
    }

    #[tokio::test]
    async fn exhausted_budget_forces_exactly_one_final_call() {
        for max in [1u32, 2, 4] {
            let mut script: Vec<_> = (0..max).map(|i| echo_round(&format!("r{i}"))).collect();
            // The forced response still asks for tools; they are ignored.
            script.push(make_tool_call_response(
                vec![make_tool_call("echo", json!({"text": "again"}))],
                "Best effort answer",
            ));
            let provider = Arc::new(SequentialMockProvider::new(script));

            let out = orchestrator(provider.clone())
                .with_max_iterations(max)
                .run("loop", &InvocationContext::new())
                .await
                .unwrap();

            assert_eq!(provider.call_count(), max as usize + 1, "max = {max}");
            assert!(out.forced_final);
            assert_eq!(out.answer, "Best effort answer");
            assert_eq!(out.summary.tool_calls, max);
            assert_eq!(out.summary.llm_calls, max + 1);

            let requests = provider.requests();
            let (last, earlier) = requests.split_last().unwrap();
            assert!(last.tools.is_empty());
            assert!(earlier.iter().all(|r| !r.tools.is_empty()));

            let instruction = last.messages.last().unwrap();
            assert_eq!(instruction.role, Role::User);
            assert_eq!(
                instruction.content,
                OrchestratorConfig::default().agent.final_instruction
            );
        }
    }

    #[tokio::test]
    async fn every_tool_call_gets_exactly_one_result() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(
                vec![
                    make_tool_call_with_id("a", "echo", json!({"text": "one"})),
                    make_tool_call_with_id("b", "failing", json!({})),
                    make_tool_call_with_id("c", "missing_tool", json!({})),
                    ToolCallRequest::new("d", "echo", "{not json"),
                ],
                "Checking",
            ),
            make_text_response("done"),
        ]));
        let out = orchestrator(provider)
            .run("go", &InvocationContext::new())
            .await
            .unwrap();

        let conversation = Conversation::with_messages(out.messages.clone());
        assert!(conversation.unanswered_tool_calls().is_empty());

        let results: Vec<&Message> = out.messages.iter().filter(|m| m.role == Role::Tool).collect();
        let ids: Vec<_> = results.iter().filter_map(|m| m.tool_call_id.as_deref()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d"]);
        assert_eq!(results[0].content, "one");
        assert!(results[1].content.contains("disk full"));
        assert!(results[2].content.contains("tool not found: missing_tool"));
        assert!(results[3].content.contains("Invalid tool arguments"));
        assert_eq!(out.summary.tool_calls, 4);
    }

    #[tokio::test]
    async fn blocking_calls_without_ids_get_unique_ids() {
        let unnamed = |text: &str| make_tool_call_with_id("", "echo", json!({ "text": text }));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![unnamed("a"), unnamed("b")], ""),
            make_tool_call_response(vec![unnamed("c")], ""),
            make_text_response("done"),
        ]));
        let out = orchestrator(provider)
            .run("go", &InvocationContext::new())
            .await
            .unwrap();

        let ids: Vec<&str> = out
            .messages
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.as_str()))
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| !id.is_empty()));
        let distinct: std::collections::HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(distinct.len(), 3);

        let conversation = Conversation::with_messages(out.messages.clone());
        assert!(conversation.unanswered_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn repetition_warning_starts_after_threshold() {
        let mut config = OrchestratorConfig::default();
        config.agent.max_iterations = 4;
        config.tools.repetition_threshold = 2;

        let mut script: Vec<_> = (0..4).map(|_| echo_round("same")).collect();
        script.push(make_text_response("stopping"));
        let provider = Arc::new(SequentialMockProvider::new(script));

        let out = Orchestrator::new(provider, ToolRegistry::new().with(EchoTool), config)
            .run("repeat", &InvocationContext::new())
            .await
            .unwrap();

        let warned: Vec<bool> = out
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.contains("[repetition warning]"))
            .collect();
        assert_eq!(warned, vec![false, false, true, true]);
    }

    #[tokio::test]
    async fn system_prompt_and_memory_seed_the_history() {
        let memory = Arc::new(InMemoryHistory::with_messages(vec![
            Message::tool_result("orphan", "left over"),
            Message::user("What is 2+2?"),
            Message::assistant("4"),
        ]));
        let provider = Arc::new(SequentialMockProvider::new(vec![
            echo_round("x"),
            make_text_response("8"),
        ]));

        let out = orchestrator(provider.clone())
            .with_system_prompt("Be brief.")
            .with_memory(memory.clone())
            .run("And doubled?", &InvocationContext::new())
            .await
            .unwrap();
        assert_eq!(out.answer, "8");

        let first = &provider.requests()[0];
        let seeded: Vec<(Role, &str)> = first
            .messages
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(
            seeded,
            vec![
                (Role::System, "Be brief."),
                (Role::User, "What is 2+2?"),
                (Role::Assistant, "4"),
                (Role::User, "And doubled?"),
            ]
        );

        // Prompt, the mirrored tool round, then the answer.
        let stored = memory.snapshot().await;
        let roles: Vec<Role> = stored[3..].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
        );
        assert_eq!(stored.last().unwrap().content, "8");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(SequentialMockProvider::scripted(vec![
            Err(ProviderError::Network("reset".into())),
            Err(ProviderError::Timeout("slow".into())),
            Ok(make_text_response("made it")),
        ]));
        let out = Orchestrator::new(
            provider.clone(),
            ToolRegistry::new(),
            fast_retries(OrchestratorConfig::default()),
        )
        .run("hi", &InvocationContext::new())
        .await
        .unwrap();

        assert_eq!(out.answer, "made it");
        assert_eq!(provider.call_count(), 3);
        assert_eq!(out.summary.llm_calls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_exhaustion_is_fatal() {
        let provider = Arc::new(SequentialMockProvider::scripted(vec![
            Err(ProviderError::Network("down".into())),
            Err(ProviderError::Network("down".into())),
            Err(ProviderError::Network("down".into())),
            Ok(make_text_response("too late")),
        ]));
        let err = Orchestrator::new(
            provider.clone(),
            ToolRegistry::new(),
            fast_retries(OrchestratorConfig::default()),
        )
        .run("hi", &InvocationContext::new())
        .await
        .unwrap_err();

        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_fast() {
        let provider = Arc::new(SequentialMockProvider::scripted(vec![Err(
            ProviderError::AuthenticationFailed("bad key".into()),
        )]));
        let err = orchestrator(provider.clone())
            .run("hi", &InvocationContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(ProviderError::AuthenticationFailed(_))));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_context_makes_no_calls() {
        let provider = Arc::new(SequentialMockProvider::single_text("never"));
        let ctx = InvocationContext::new();
        ctx.cancellation_token().cancel();

        let err = orchestrator(provider.clone()).run("hi", &ctx).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_deadline_stops_before_next_model_call() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("slow", json!({"ms": 5_000}))], ""),
            make_text_response("never"),
        ]));
        let ctx = InvocationContext::new().with_timeout(Duration::from_secs(1));

        let err = Orchestrator::new(
            provider.clone(),
            ToolRegistry::new().with(SlowTool::default()),
            OrchestratorConfig::default(),
        )
        .run("hi", &ctx)
        .await
        .unwrap_err();

        assert!(matches!(err, Error::DeadlineExceeded));
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn buffered_stream_replays_tool_round_text_before_stop() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("echo", json!({"text": "a"}))], "first thought"),
            make_tool_call_response(
                vec![make_tool_call_with_id("call_2", "echo", json!({"text": "b"}))],
                "second thought",
            ),
            make_text_response("final answer"),
        ]));
        let events = orchestrator(provider)
            .with_max_iterations(3)
            .run_stream("go", &InvocationContext::new())
            .collect_all()
            .await;

        let kinds: Vec<StreamEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds.first(), Some(&StreamEventType::MessageStart));
        assert_eq!(kinds.last(), Some(&StreamEventType::MessageStop));

        // Nothing from the tool rounds is shown before the final round's text.
        let first_delta = kinds
            .iter()
            .position(|k| *k == StreamEventType::ContentDelta)
            .unwrap();
        let last_tool_result = kinds
            .iter()
            .rposition(|k| *k == StreamEventType::ToolResult)
            .unwrap();
        assert!(first_delta > last_tool_result);

        let live: String = events
            .iter()
            .filter(|e| e.event_type == StreamEventType::ContentDelta && !e.metadata.contains_key("replayed"))
            .map(|e| e.content.as_str())
            .collect();
        assert_eq!(live, "final answer");

        // Replayed text comes right before message_stop, in original order.
        let complete = kinds
            .iter()
            .position(|k| *k == StreamEventType::ContentComplete)
            .unwrap();
        let tail = &events[complete + 1..events.len() - 1];
        assert!(tail.iter().all(|e| e.metadata.contains_key("replayed")));
        let replayed: String = tail.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(replayed, "first thoughtsecond thought");

        let stop = events.last().unwrap();
        assert_eq!(stop.metadata["answer"], "final answer");
        assert_eq!(stop.metadata["summary"]["tool_calls"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn live_stream_forwards_tool_round_text_immediately() {
        let mut config = OrchestratorConfig::default();
        config.streaming.buffer_intermediate_content = false;
        let provider = Arc::new(
            SequentialMockProvider::new(vec![
                make_tool_call_response(vec![make_tool_call("echo", json!({"text": "a"}))], "thinking"),
                make_text_response("answer"),
            ])
            .with_stream_delay(Duration::from_millis(50)),
        );
        let started = tokio::time::Instant::now();
        let mut stream = Orchestrator::new(provider, ToolRegistry::new().with(EchoTool), config)
            .run_stream("go", &InvocationContext::new());

        // The first text chunk is relayed while the rest of the turn is
        // still in flight: two text chunks, two tool fragments, then done.
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            let first_text = event.event_type == StreamEventType::ContentDelta
                && !events.iter().any(|e: &StreamEvent| e.event_type == StreamEventType::ContentDelta);
            if first_text {
                assert!(started.elapsed() < Duration::from_millis(100));
            }
            events.push(event);
        }
        assert!(started.elapsed() >= Duration::from_millis(250));

        let kinds: Vec<StreamEventType> = events.iter().map(|e| e.event_type).collect();
        let first_delta = kinds.iter().position(|k| *k == StreamEventType::ContentDelta).unwrap();
        let tool_use = kinds.iter().position(|k| *k == StreamEventType::ToolUse).unwrap();
        assert!(first_delta < tool_use);
        assert_eq!(
            kinds.iter().filter(|k| **k == StreamEventType::ContentComplete).count(),
            2
        );
        assert!(!events.iter().any(|e| e.metadata.contains_key("replayed")));
        assert_eq!(kinds.last(), Some(&StreamEventType::MessageStop));
    }

    #[tokio::test]
    async fn streamed_calls_without_ids_get_unique_ids() {
        let unnamed = |text: &str| make_tool_call_with_id("", "echo", json!({ "text": text }));
        let memory = Arc::new(InMemoryHistory::new());
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![unnamed("a")], ""),
            make_tool_call_response(vec![unnamed("b")], ""),
            make_text_response("done"),
        ]));
        let events = orchestrator(provider)
            .with_memory(memory.clone())
            .run_stream("go", &InvocationContext::new())
            .collect_all()
            .await;
        assert_eq!(events.last().unwrap().event_type, StreamEventType::MessageStop);

        let announced: Vec<String> = events
            .iter()
            .filter(|e| e.event_type == StreamEventType::ToolUse)
            .filter_map(|e| e.tool_call.as_ref().map(|c| c.id.clone()))
            .collect();
        assert_eq!(announced.len(), 2);
        assert!(announced.iter().all(|id| !id.is_empty()));
        assert_ne!(announced[0], announced[1]);

        let stored = memory.snapshot().await;
        let recorded: Vec<String> = stored
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();
        assert_eq!(recorded, announced);
        assert!(Conversation::with_messages(stored).unanswered_tool_calls().is_empty());
    }

    #[tokio::test]
    async fn cancelling_mid_stream_ends_with_error_event() {
        let provider = Arc::new(SequentialMockProvider::new(vec![
            make_tool_call_response(vec![make_tool_call("slow", json!({"ms": 60_000}))], ""),
            make_text_response("never"),
        ]));
        let ctx = InvocationContext::new();
        let mut stream = Orchestrator::new(
            provider.clone(),
            ToolRegistry::new().with(SlowTool::default()),
            OrchestratorConfig::default(),
        )
        .run_stream("go", &ctx);

        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            if event.event_type == StreamEventType::ToolUse {
                ctx.cancellation_token().cancel();
            }
            events.push(event);
        }

        let last = events.last().unwrap();
        assert_eq!(last.event_type, StreamEventType::Error);
        assert_eq!(last.metadata["kind"], "cancelled");
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert!(stream.recv().await.is_none());
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn provider_failure_in_stream_is_a_terminal_error_event() {
        let provider = Arc::new(SequentialMockProvider::scripted(vec![Err(
            ProviderError::ModelNotFound("gpt-x".into()),
        )]));
        let events = orchestrator(provider)
            .run_stream("go", &InvocationContext::new())
            .collect_all()
            .await;

        let kinds: Vec<StreamEventType> = events.iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec![StreamEventType::MessageStart, StreamEventType::Error]);
        assert_eq!(events[1].metadata["kind"], "provider");
    }

    #[tokio::test]
    async fn telemetry_engine_sees_the_whole_run() {
        let engine = Arc::new(TelemetryEngine::new());
        let provider = Arc::new(SequentialMockProvider::new(vec![
            echo_round("x"),
            make_text_response("done"),
        ]));
        orchestrator(provider)
            .with_tracer(engine.clone())
            .run("go", &InvocationContext::new())
            .await
            .unwrap();

        let snapshot = engine.usage_snapshot();
        assert_eq!(snapshot.trace_count, 1);
        assert_eq!(snapshot.llm_calls, 2);
        assert_eq!(snapshot.tool_executions, 1);
        assert_eq!(snapshot.total_input_tokens, 20);

        let trace = engine.recent_traces(1).pop().unwrap();
        assert!(trace.is_finished());
        assert_eq!(trace.success, Some(true));
    }
}

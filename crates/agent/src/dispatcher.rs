//! Tool dispatcher: resolves a requested tool, executes it, and turns the
//! outcome into exactly one [`ToolResult`].
//!
//! Recoverable failures (unknown tool, bad arguments, handler errors,
//! timeouts) become result content. Only fatal tool errors (recursion limit,
//! cancellation) come back as `Err` and abort the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use toolweave_core::{
    ConversationMemory, ExecutionSummary, InvocationContext, Message, Result, Tool,
    ToolCallRequest, ToolDefinition, ToolError, ToolRegistry, ToolResult, TraceEvent, Tracer,
};
use tracing::{debug, warn};

use crate::guard::RepetitionGuard;

/// Name of the batch pseudo-tool advertised next to the registry's tools.
pub const BATCH_TOOL_NAME: &str = "parallel_tools";

#[derive(Debug, Deserialize)]
struct BatchRequest {
    tool_calls: Vec<BatchEntry>,
}

#[derive(Debug, Deserialize)]
struct BatchEntry {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

/// Dispatches tool calls for one run.
pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    guard: RepetitionGuard,
    memory: Option<Arc<dyn ConversationMemory>>,
    tracer: Arc<dyn Tracer>,
    run_id: String,
    tool_timeout: Option<Duration>,
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        guard: RepetitionGuard,
        tracer: Arc<dyn Tracer>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            guard,
            memory: None,
            tracer,
            run_id: run_id.into(),
            tool_timeout: None,
        }
    }

    /// Mirror every dispatch into a history collaborator.
    pub fn with_memory(mut self, memory: Option<Arc<dyn ConversationMemory>>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn guard(&self) -> &RepetitionGuard {
        &self.guard
    }

    /// Tool schemas for the model: every registered tool, plus the batch
    /// pseudo-tool when there is anything to batch.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.registry.definitions();
        if !defs.is_empty() && self.registry.get(BATCH_TOOL_NAME).is_none() {
            defs.push(batch_definition());
        }
        defs
    }

    /// Dispatch one tool call. Always yields a result unless the failure is fatal.
    pub async fn dispatch(
        &self,
        call: &ToolCallRequest,
        ctx: &InvocationContext,
    ) -> Result<ToolResult> {
        let started = Instant::now();
        let mut result = if call.name == BATCH_TOOL_NAME && self.registry.get(BATCH_TOOL_NAME).is_none()
        {
            self.dispatch_batch(call, ctx).await?
        } else {
            self.invoke(&call.id, &call.name, parse_arguments(&call.arguments), ctx)
                .await?
        };
        result.duration_ms = started.elapsed().as_millis() as u64;

        self.mirror(call, &result).await;
        Ok(result)
    }

    async fn dispatch_batch(
        &self,
        call: &ToolCallRequest,
        ctx: &InvocationContext,
    ) -> Result<ToolResult> {
        let batch: BatchRequest = match serde_json::from_str(&call.arguments) {
            Ok(batch) => batch,
            Err(e) => {
                return Ok(ToolResult::failure(
                    &call.id,
                    BATCH_TOOL_NAME,
                    ToolError::InvalidArguments(format!("malformed batch request: {e}")).to_string(),
                ));
            }
        };

        if batch.tool_calls.is_empty() {
            return Ok(ToolResult::failure(
                &call.id,
                BATCH_TOOL_NAME,
                ToolError::InvalidArguments("batch request contains no tool calls".into())
                    .to_string(),
            ));
        }

        debug!(call_id = %call.id, count = batch.tool_calls.len(), "Dispatching tool batch");

        let invocations = batch.tool_calls.into_iter().enumerate().map(|(index, entry)| {
            let id = format!("{}#{index}", call.id);
            async move {
                let arguments = normalize_batch_arguments(entry.arguments);
                self.invoke(&id, &entry.name, arguments, ctx).await
            }
        });

        // join_all keeps request order regardless of completion order.
        let mut sub_results = Vec::new();
        for outcome in join_all(invocations).await {
            sub_results.push(outcome?);
        }

        let folded = sub_results
            .iter()
            .enumerate()
            .map(|(i, sub)| {
                let marker = if sub.is_error() { " (error)" } else { "" };
                format!(
                    "[{}] {}{}:\n{}",
                    i + 1,
                    sub.tool_name,
                    marker,
                    sub.to_message_content()
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut result = ToolResult::success(&call.id, BATCH_TOOL_NAME, folded);
        result.sub_results = sub_results;
        Ok(result)
    }

    /// Execute a single named tool and apply the repetition guard.
    async fn invoke(
        &self,
        call_id: &str,
        name: &str,
        arguments: std::result::Result<serde_json::Value, (serde_json::Value, ToolError)>,
        ctx: &InvocationContext,
    ) -> Result<ToolResult> {
        let started = Instant::now();
        let (guard_args, outcome) = match arguments {
            Ok(args) => {
                let outcome = match self.registry.get(name) {
                    Some(tool) => self.execute_tool(tool, name, args.clone(), ctx).await,
                    None => Err(ToolError::NotFound(name.to_string())),
                };
                (args, outcome)
            }
            Err((raw, err)) => (raw, Err(err)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut result = match outcome {
            Ok(output) => {
                debug!(tool = name, call_id, duration_ms, "Tool succeeded");
                let mut result = ToolResult::success(call_id, name, output.content);
                result.nested_summary = output.summary;
                result
            }
            Err(err) => {
                let message = err.to_string();
                if let Some(fatal) = err.into_fatal() {
                    warn!(tool = name, call_id, error = %fatal, "Fatal tool error, aborting run");
                    self.trace(call_id, name, false, duration_ms);
                    return Err(fatal);
                }
                warn!(tool = name, call_id, error = %message, "Tool failed");
                ToolResult::failure(call_id, name, message)
            }
        };
        result.duration_ms = duration_ms;

        if let Some(warning) = self.guard.record(name, &guard_args) {
            result.content = if result.content.is_empty() {
                warning
            } else {
                format!("{}\n\n{warning}", result.content)
            };
        }

        self.trace(call_id, name, !result.is_error(), duration_ms);
        Ok(result)
    }

    async fn execute_tool(
        &self,
        tool: Arc<dyn Tool>,
        name: &str,
        arguments: serde_json::Value,
        ctx: &InvocationContext,
    ) -> std::result::Result<toolweave_core::ToolOutput, ToolError> {
        match self.tool_timeout {
            Some(limit) => tokio::time::timeout(limit, tool.execute(arguments, ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(ToolError::Timeout {
                        tool_name: name.to_string(),
                        timeout_secs: limit.as_secs(),
                    })
                }),
            None => tool.execute(arguments, ctx).await,
        }
    }

    fn trace(&self, call_id: &str, name: &str, success: bool, duration_ms: u64) {
        self.tracer.record(TraceEvent::ToolDispatched {
            run_id: self.run_id.clone(),
            tool_name: name.to_string(),
            call_id: call_id.to_string(),
            success,
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    /// Record the call and its result as an assistant/tool message pair.
    async fn mirror(&self, call: &ToolCallRequest, result: &ToolResult) {
        let Some(memory) = &self.memory else {
            return;
        };
        let pair = [
            Message::assistant_with_tools("", vec![call.clone()]),
            result.to_message(),
        ];
        for message in pair {
            if let Err(e) = memory.add_message(message).await {
                warn!(call_id = %call.id, "Failed to mirror tool call to memory: {e}");
                return;
            }
        }
    }
}

/// Fold one dispatch into run counters. Batches count each sub-invocation;
/// results carrying a nested summary count as sub-agent calls.
pub fn record_result(summary: &mut ExecutionSummary, result: &ToolResult) {
    if !result.sub_results.is_empty() {
        for sub in &result.sub_results {
            record_result(summary, sub);
        }
        return;
    }
    match &result.nested_summary {
        Some(nested) => summary.record_sub_agent(&result.tool_name, nested),
        None => summary.record_tool(&result.tool_name),
    }
}

/// Parse a raw argument payload. Empty means `{}`. On failure the raw text
/// is kept for the repetition guard key.
fn parse_arguments(
    raw: &str,
) -> std::result::Result<serde_json::Value, (serde_json::Value, ToolError)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(trimmed).map_err(|e| {
        (
            serde_json::Value::String(trimmed.to_string()),
            ToolError::InvalidArguments(format!("arguments are not valid JSON: {e}")),
        )
    })
}

/// Batch entries may carry arguments as an object or as a JSON string.
fn normalize_batch_arguments(
    arguments: serde_json::Value,
) -> std::result::Result<serde_json::Value, (serde_json::Value, ToolError)> {
    match arguments {
        serde_json::Value::Null => Ok(serde_json::Value::Object(serde_json::Map::new())),
        serde_json::Value::String(raw) => parse_arguments(&raw),
        other => Ok(other),
    }
}

fn batch_definition() -> ToolDefinition {
    ToolDefinition {
        name: BATCH_TOOL_NAME.into(),
        description: "Run several independent tool calls concurrently. Results come back in \
                      request order, one section per call."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "tool_calls": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": { "type": "string" },
                            "arguments": { "type": "object" }
                        },
                        "required": ["name"]
                    }
                }
            },
            "required": ["tool_calls"]
        }),
    }
}

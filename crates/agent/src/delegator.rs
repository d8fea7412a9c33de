//! Sub-agent delegation: one orchestrator exposed to another as a tool.
//!
//! The nested run gets a context one level deeper, its own deadline (per
//! [`DeadlinePolicy`]) and a child of the caller's cancellation token, so an
//! explicit abort always reaches it. When the caller is streaming, the nested
//! run streams too and its events are relayed into the caller's stream.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use toolweave_config::{DeadlinePolicy, DelegationConfig};
use toolweave_core::{
    Error, EventForwarder, ExecutionSummary, InvocationContext, MAX_RECURSION_DEPTH,
    RecursionContext, StreamEventType, Tool, ToolError, ToolOutput, TraceEvent,
};
use tracing::{debug, info, warn};

use crate::orchestrator::{AGENT_KEY, Orchestrator, RUN_ID_KEY};

/// A nested orchestrator callable as a tool named `name`.
pub struct SubAgentTool {
    name: String,
    description: String,
    orchestrator: Arc<Orchestrator>,
    timeout: Duration,
    policy: DeadlinePolicy,
}

impl SubAgentTool {
    /// Wrap `orchestrator`, taking timeout and deadline policy from its
    /// `[delegation]` config.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        orchestrator: Orchestrator,
    ) -> Self {
        let delegation: &DelegationConfig = &orchestrator.config().delegation;
        let timeout = delegation.timeout();
        let policy = delegation.deadline_policy;
        Self {
            name: name.into(),
            description: description.into(),
            orchestrator: Arc::new(orchestrator),
            timeout,
            policy,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: DeadlinePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Context for the nested run: same values and cancellation lineage,
    /// one level deeper, with the deadline chosen by the policy.
    fn child_context(&self, ctx: &InvocationContext, recursion: RecursionContext) -> InvocationContext {
        let base = ctx.child().with_recursion(recursion);
        let own = tokio::time::Instant::now() + self.timeout;

        match (self.policy, ctx.deadline()) {
            (DeadlinePolicy::Inherit, Some(parent)) => base.with_deadline(parent.min(own)),
            (DeadlinePolicy::Extend, Some(parent)) if parent < own => {
                warn!(
                    sub_agent = %self.name,
                    parent_remaining = ?ctx.remaining(),
                    timeout_secs = self.timeout.as_secs(),
                    "Caller deadline is shorter than the sub-agent timeout; extending"
                );
                base.with_deadline(own)
            }
            _ => base.with_deadline(own),
        }
    }

    /// Run the nested orchestrator in streaming mode, relaying every
    /// non-lifecycle event to `forwarder`.
    async fn run_streaming(
        &self,
        task: &str,
        ctx: &InvocationContext,
        forwarder: &EventForwarder,
    ) -> Result<(String, ExecutionSummary), ToolError> {
        let mut events = self.orchestrator.run_stream(task, ctx);
        let mut relayed_content = String::new();

        while let Some(event) = events.recv().await {
            match event.event_type {
                StreamEventType::MessageStart => {}
                StreamEventType::MessageStop => {
                    let answer = event
                        .metadata
                        .get("answer")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .unwrap_or(relayed_content);
                    let summary = event
                        .metadata
                        .get("summary")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .unwrap_or_default();
                    return Ok((answer, summary));
                }
                StreamEventType::Error => return Err(self.error_from_event(&event)),
                _ => {
                    if event.event_type == StreamEventType::ContentDelta {
                        relayed_content.push_str(&event.content);
                    }
                    if forwarder.send(event).await.is_err() {
                        return Err(ToolError::Cancelled(
                            "event stream closed by consumer".into(),
                        ));
                    }
                }
            }
        }

        Err(ToolError::ExecutionFailed {
            tool_name: self.name.clone(),
            reason: "sub-agent stream ended without a terminal event".into(),
        })
    }

    fn error_from_event(&self, event: &toolweave_core::StreamEvent) -> ToolError {
        let kind = event.metadata.get("kind").and_then(|v| v.as_str());
        let number = |key: &str| {
            event
                .metadata
                .get(key)
                .and_then(|v| v.as_u64())
                .map(|n| n as u32)
        };
        match kind {
            Some("recursion_limit") => ToolError::RecursionLimit {
                depth: number("depth").unwrap_or(MAX_RECURSION_DEPTH + 1),
                max: number("max").unwrap_or(MAX_RECURSION_DEPTH),
            },
            Some("cancelled") => ToolError::Cancelled(event.content.clone()),
            _ => ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason: event.content.clone(),
            },
        }
    }

    /// Failures of the nested run as seen by the caller.
    fn nested_error(&self, err: Error) -> ToolError {
        match ToolError::from(err) {
            ToolError::ExecutionFailed { reason, .. } => ToolError::ExecutionFailed {
                tool_name: self.name.clone(),
                reason,
            },
            other => other,
        }
    }
}

#[async_trait]
impl Tool for SubAgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "task": {
                    "type": "string",
                    "description": "The task for the sub-agent, stated completely"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let parent = ctx
            .value(AGENT_KEY)
            .and_then(|v| v.as_str())
            .unwrap_or("root")
            .to_string();

        // Checked before anything else, including argument validation.
        let recursion = ctx
            .recursion()
            .descend(&parent, &self.name, MAX_RECURSION_DEPTH)
            .inspect_err(|e| warn!(sub_agent = %self.name, parent = %parent, "{e}"))?;

        let task = arguments
            .get("task")
            .and_then(|v| v.as_str())
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| {
                ToolError::InvalidArguments("missing required string field 'task'".into())
            })?;

        let depth = recursion.depth;
        let invocation_id = recursion.invocation_id.clone().unwrap_or_default();
        let child_ctx = self.child_context(ctx, recursion);
        let started = Instant::now();

        info!(
            sub_agent = %self.name,
            parent = %parent,
            depth,
            invocation_id = %invocation_id,
            streaming = ctx.forwarder().is_some(),
            "Delegating to sub-agent"
        );

        let outcome = match ctx.forwarder() {
            Some(forwarder) => self.run_streaming(task, &child_ctx, forwarder).await,
            None => self
                .orchestrator
                .run(task, &child_ctx)
                .await
                .map(|out| (out.answer, out.summary))
                .map_err(|e| self.nested_error(e)),
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        if let Some(run_id) = ctx.value(RUN_ID_KEY).and_then(|v| v.as_str()) {
            self.orchestrator.tracer().record(TraceEvent::SubAgentDelegated {
                run_id: run_id.to_string(),
                parent: parent.clone(),
                child: self.name.clone(),
                depth,
                invocation_id: invocation_id.clone(),
                success: outcome.is_ok(),
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        let (answer, summary) = outcome?;
        debug!(
            sub_agent = %self.name,
            depth,
            duration_ms,
            llm_calls = summary.llm_calls,
            "Sub-agent finished"
        );
        Ok(ToolOutput::delegated(answer, summary))
    }
}

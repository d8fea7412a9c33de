//! Thread-safe telemetry engine. Turns trace callbacks into per-run
//! traces and keeps running usage totals.

use parking_lot::RwLock;
use toolweave_core::{TraceEvent, Tracer};

use crate::TelemetryError;
use crate::model::*;

/// Completed traces kept before the oldest are pruned.
const MAX_TRACES: usize = 5_000;

/// The core telemetry engine.
///
/// Implements [`Tracer`], so an orchestrator can report into it directly.
/// Nested runs get their own trace, keyed by their run id.
pub struct TelemetryEngine {
    /// All recorded traces (most recent last).
    traces: RwLock<Vec<Trace>>,
    /// Running totals.
    totals: RwLock<RunningTotals>,
}

#[derive(Debug, Default)]
struct RunningTotals {
    total_input_tokens: u64,
    total_output_tokens: u64,
    total_llm_calls: u64,
    total_tool_execs: u64,
    total_sub_agents: u64,
    failed_runs: u64,
}

impl TelemetryEngine {
    pub fn new() -> Self {
        Self {
            traces: RwLock::new(Vec::new()),
            totals: RwLock::new(RunningTotals::default()),
        }
    }

    // ── Trace management ──────────────────────────────────────────────

    /// Start a new trace for a run.
    pub fn start_trace(&self, run_id: impl Into<String>, agent: impl Into<String>, depth: u32) {
        let trace = Trace::new(run_id, agent, depth);
        let mut traces = self.traces.write();

        if traces.len() >= MAX_TRACES {
            // Remove oldest completed traces first
            let drain_count = MAX_TRACES / 10;
            let mut removed = 0;
            traces.retain(|t| {
                if removed >= drain_count || !t.is_finished() {
                    return true;
                }
                removed += 1;
                false
            });
        }

        traces.push(trace);
    }

    /// End a trace.
    pub fn end_trace(&self, run_id: &str, success: bool) {
        if !success {
            self.totals.write().failed_runs += 1;
        }
        let mut traces = self.traces.write();
        if let Some(trace) = traces.iter_mut().rev().find(|t| t.id == run_id) {
            trace.end(success);
        }
    }

    /// Record a completed span in a trace and update running totals.
    pub fn record_span(&self, run_id: &str, span: Span) {
        {
            let mut totals = self.totals.write();
            totals.total_input_tokens += span.input_tokens.unwrap_or(0) as u64;
            totals.total_output_tokens += span.output_tokens.unwrap_or(0) as u64;

            match span.kind {
                SpanKind::LlmCall => totals.total_llm_calls += 1,
                SpanKind::ToolExecution => totals.total_tool_execs += 1,
                SpanKind::SubAgent => totals.total_sub_agents += 1,
                SpanKind::Run => {}
            }
        }

        let mut traces = self.traces.write();
        match traces.iter_mut().rev().find(|t| t.id == run_id) {
            Some(trace) => trace.add_span(span),
            None => tracing::debug!(run_id, kind = %span.kind, "Span for unknown trace dropped"),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────

    /// Get a specific trace by run id.
    pub fn get_trace(&self, run_id: &str) -> Option<Trace> {
        self.traces.read().iter().find(|t| t.id == run_id).cloned()
    }

    /// List recent traces (most recent first).
    pub fn recent_traces(&self, limit: usize) -> Vec<Trace> {
        self.traces.read().iter().rev().take(limit).cloned().collect()
    }

    /// Total number of traces retained.
    pub fn trace_count(&self) -> usize {
        self.traces.read().len()
    }

    /// Serialize one trace as pretty JSON.
    pub fn export_trace_json(&self, run_id: &str) -> Result<String, TelemetryError> {
        let trace = self
            .get_trace(run_id)
            .ok_or_else(|| TelemetryError::UnknownTrace(run_id.to_string()))?;
        Ok(serde_json::to_string_pretty(&trace)?)
    }

    /// Get a real-time usage snapshot.
    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let totals = self.totals.read();
        UsageSnapshot {
            total_input_tokens: totals.total_input_tokens,
            total_output_tokens: totals.total_output_tokens,
            llm_calls: totals.total_llm_calls,
            tool_executions: totals.total_tool_execs,
            sub_agent_calls: totals.total_sub_agents,
            failed_runs: totals.failed_runs,
            trace_count: self.traces.read().len() as u64,
        }
    }
}

impl Default for TelemetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for TelemetryEngine {
    fn record(&self, event: TraceEvent) {
        match event {
            TraceEvent::RunStarted {
                run_id,
                agent,
                depth,
                ..
            } => self.start_trace(run_id, agent, depth),
            TraceEvent::ModelCall {
                run_id,
                model,
                iteration,
                forced_final,
                success,
                duration_ms,
                usage,
                timestamp,
            } => {
                let mut span =
                    Span::completed(SpanKind::LlmCall, model, timestamp, duration_ms, success)
                        .with_metadata("iteration", iteration.into())
                        .with_metadata("forced_final", forced_final.into());
                if let Some(usage) = usage {
                    span.record_tokens(usage.prompt_tokens, usage.completion_tokens);
                }
                self.record_span(&run_id, span);
            }
            TraceEvent::ToolDispatched {
                run_id,
                tool_name,
                call_id,
                success,
                duration_ms,
                timestamp,
            } => {
                let span = Span::completed(
                    SpanKind::ToolExecution,
                    tool_name,
                    timestamp,
                    duration_ms,
                    success,
                )
                .with_metadata("call_id", call_id.into());
                self.record_span(&run_id, span);
            }
            TraceEvent::SubAgentDelegated {
                run_id,
                parent,
                child,
                depth,
                invocation_id,
                success,
                duration_ms,
                timestamp,
            } => {
                let span =
                    Span::completed(SpanKind::SubAgent, child, timestamp, duration_ms, success)
                        .with_metadata("parent", parent.into())
                        .with_metadata("depth", depth.into())
                        .with_metadata("invocation_id", invocation_id.into());
                self.record_span(&run_id, span);
            }
            TraceEvent::RunFinished {
                run_id, success, ..
            } => self.end_trace(&run_id, success),
        }
    }
}

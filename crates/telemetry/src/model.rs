//! Data model for run traces, spans and usage snapshots.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Span ──────────────────────────────────────────────────────────────────

/// The kind of work a span represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    /// A whole run (prompt → final answer).
    Run,
    /// A model call.
    LlmCall,
    /// A tool execution.
    ToolExecution,
    /// A delegation to a nested orchestrator.
    SubAgent,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Run => write!(f, "run"),
            Self::LlmCall => write!(f, "llm_call"),
            Self::ToolExecution => write!(f, "tool_execution"),
            Self::SubAgent => write!(f, "sub_agent"),
        }
    }
}

/// A single traced execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique identifier.
    pub id: String,
    /// Parent span id (None for root spans).
    pub parent_id: Option<String>,
    /// What kind of work this represents.
    pub kind: SpanKind,
    /// Human-readable label (model name, tool name, child agent name).
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Input tokens consumed (for LLM calls).
    pub input_tokens: Option<u32>,
    /// Output tokens produced (for LLM calls).
    pub output_tokens: Option<u32>,
    pub success: Option<bool>,
    /// Arbitrary metadata.
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Span {
    /// Create a new span with the given kind and label.
    pub fn new(kind: SpanKind, label: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            kind,
            label: label.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            success: None,
            metadata: serde_json::Map::new(),
        }
    }

    /// A span for work that already finished at `ended_at` after `duration_ms`.
    pub fn completed(
        kind: SpanKind,
        label: impl Into<String>,
        ended_at: DateTime<Utc>,
        duration_ms: u64,
        success: bool,
    ) -> Self {
        let mut span = Self::new(kind, label);
        span.started_at = ended_at - Duration::milliseconds(duration_ms as i64);
        span.ended_at = Some(ended_at);
        span.duration_ms = Some(duration_ms);
        span.success = Some(success);
        span
    }

    /// Set the parent span.
    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Mark the span as ended with the given success status.
    pub fn end(&mut self, success: bool) {
        let now = Utc::now();
        self.ended_at = Some(now);
        self.duration_ms = Some(
            now.signed_duration_since(self.started_at)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.success = Some(success);
    }

    /// Record token usage.
    pub fn record_tokens(&mut self, input: u32, output: u32) {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
    }

    /// Total tokens (input + output), or 0 if not recorded.
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.unwrap_or(0) + self.output_tokens.unwrap_or(0)
    }
}

// ── Trace ─────────────────────────────────────────────────────────────────

/// All spans recorded for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trace {
    /// The run id reported by the orchestrator.
    pub id: String,
    /// Agent name that owns the run.
    pub agent: String,
    /// Delegation depth of the run (0 for top-level).
    pub depth: u32,
    /// The root `Run` span; every other span is its child.
    pub root_span_id: String,
    pub spans: Vec<Span>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub success: Option<bool>,
}

impl Trace {
    /// Create a new trace for a run, with its root span open.
    pub fn new(id: impl Into<String>, agent: impl Into<String>, depth: u32) -> Self {
        let agent = agent.into();
        let root = Span::new(SpanKind::Run, agent.clone());
        Self {
            id: id.into(),
            agent,
            depth,
            root_span_id: root.id.clone(),
            started_at: root.started_at,
            spans: vec![root],
            ended_at: None,
            success: None,
        }
    }

    /// Add a span under the root span.
    pub fn add_span(&mut self, span: Span) {
        let span = match span.parent_id {
            Some(_) => span,
            None if span.kind == SpanKind::Run => span,
            None => span.with_parent(self.root_span_id.clone()),
        };
        self.spans.push(span);
    }

    /// Mark the trace and its root span as complete.
    pub fn end(&mut self, success: bool) {
        if let Some(root) = self.spans.iter_mut().find(|s| s.id == self.root_span_id) {
            root.end(success);
        }
        self.ended_at = Some(Utc::now());
        self.success = Some(success);
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at.is_some()
    }

    /// Total tokens across all spans.
    pub fn total_tokens(&self) -> u32 {
        self.spans.iter().map(|s| s.total_tokens()).sum()
    }

    fn count(&self, kind: SpanKind) -> usize {
        self.spans.iter().filter(|s| s.kind == kind).count()
    }

    /// Number of LLM calls in this trace.
    pub fn llm_call_count(&self) -> usize {
        self.count(SpanKind::LlmCall)
    }

    /// Number of tool executions in this trace.
    pub fn tool_execution_count(&self) -> usize {
        self.count(SpanKind::ToolExecution)
    }

    pub fn sub_agent_count(&self) -> usize {
        self.count(SpanKind::SubAgent)
    }
}

// ── Aggregated views ──────────────────────────────────────────────────────

/// A point-in-time usage snapshot across every run the engine has seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub llm_calls: u64,
    pub tool_executions: u64,
    pub sub_agent_calls: u64,
    /// Runs that ended with an error
    pub failed_runs: u64,
    /// Number of traces retained
    pub trace_count: u64,
}

impl UsageSnapshot {
    pub fn total_tokens(&self) -> u64 {
        self.total_input_tokens + self.total_output_tokens
    }
}

//! Tool trait: the abstraction over agent capabilities.
//!
//! A tool is a named capability the model can ask for. The registry is a
//! closed mapping from name to handler; lookups are exact-name matches.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::InvocationContext;
use crate::error::ToolError;
use crate::message::Message;
use crate::provider::ToolDefinition;
use crate::summary::ExecutionSummary;

/// What a tool hands back on success.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Text fed back to the model
    pub content: String,

    /// Set by sub-agent tools so the parent can merge nested counters
    pub summary: Option<ExecutionSummary>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            summary: None,
        }
    }

    /// Output of a delegated run, carrying the nested summary.
    pub fn delegated(content: impl Into<String>, summary: ExecutionSummary) -> Self {
        Self {
            content: content.into(),
            summary: Some(summary),
        }
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for ToolOutput {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

/// The outcome of dispatching one tool call.
///
/// Produced exactly once per call, including on failure: `error` is set
/// and `content` may still carry advisory text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub tool_call_id: String,

    /// The tool that was requested
    pub tool_name: String,

    /// The output content
    pub content: String,

    /// Failure description, if the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wall-clock execution time
    #[serde(default)]
    pub duration_ms: u64,

    /// Per-invocation results of a batched call, in request order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_results: Vec<ToolResult>,

    /// Summary of a delegated run, if this call ran a sub-agent
    #[serde(skip)]
    pub nested_summary: Option<ExecutionSummary>,
}

impl ToolResult {
    pub fn success(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn failure(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text the model sees for this result.
    pub fn to_message_content(&self) -> String {
        match &self.error {
            Some(err) if self.content.is_empty() => format!("Error: {err}"),
            Some(err) => format!("Error: {err}\n{}", self.content),
            None => self.content.clone(),
        }
    }

    /// The tool-role history message answering this call.
    pub fn to_message(&self) -> Message {
        Message::tool_result(&self.tool_call_id, self.to_message_content())
            .with_metadata("tool_name", serde_json::Value::String(self.tool_name.clone()))
            .with_metadata("is_error", serde_json::Value::Bool(self.is_error()))
    }
}

/// The core Tool trait.
///
/// Sub-agents implement this too, which is how one orchestrator calls
/// another. `ctx` carries cancellation, deadline and recursion depth.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with already-parsed arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &InvocationContext,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.register_arc(Arc::from(tool));
    }

    /// Register a shared tool handle.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Builder-style registration.
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register_arc(Arc::new(tool));
        self
    }

    /// Get a tool by exact name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tool definitions, sorted by name so requests are deterministic.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}

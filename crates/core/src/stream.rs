//! Normalized stream events.
//!
//! Whatever a provider streams, the streaming pipeline turns it into this
//! one event shape. Events are produced once, never mutated, and read in
//! emission order by a single consumer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::ToolCallRequest;

/// The kind of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    MessageStart,
    ContentDelta,
    ToolUse,
    ToolResult,
    ContentComplete,
    MessageStop,
    Error,
}

impl StreamEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageStart => "message_start",
            Self::ContentDelta => "content_delta",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
            Self::ContentComplete => "content_complete",
            Self::MessageStop => "message_stop",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for StreamEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event in the uniform stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,

    /// Text payload: a content delta, a tool result, or an error message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,

    /// The tool call this event is about (`tool_use` and `tool_result`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCallRequest>,

    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,

    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    fn new(event_type: StreamEventType) -> Self {
        Self {
            event_type,
            content: String::new(),
            tool_call: None,
            metadata: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn message_start() -> Self {
        Self::new(StreamEventType::MessageStart)
    }

    pub fn content_delta(content: impl Into<String>) -> Self {
        let mut event = Self::new(StreamEventType::ContentDelta);
        event.content = content.into();
        event
    }

    pub fn tool_use(call: ToolCallRequest) -> Self {
        let mut event = Self::new(StreamEventType::ToolUse);
        event.tool_call = Some(call);
        event
    }

    pub fn tool_result(call: ToolCallRequest, content: impl Into<String>, is_error: bool) -> Self {
        let mut event = Self::new(StreamEventType::ToolResult);
        event.content = content.into();
        event.tool_call = Some(call);
        event.with_metadata("is_error", serde_json::Value::Bool(is_error))
    }

    pub fn content_complete() -> Self {
        Self::new(StreamEventType::ContentComplete)
    }

    pub fn message_stop() -> Self {
        Self::new(StreamEventType::MessageStop)
    }

    /// A terminal error event; `kind` is the machine-readable error label.
    pub fn error(message: impl Into<String>, kind: &str) -> Self {
        let mut event = Self::new(StreamEventType::Error);
        event.content = message.into();
        event.with_metadata("kind", serde_json::Value::String(kind.to_string()))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            StreamEventType::MessageStop | StreamEventType::Error
        )
    }

    /// Lifecycle events frame a run; everything else is payload.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self.event_type,
            StreamEventType::MessageStart | StreamEventType::MessageStop | StreamEventType::Error
        )
    }
}

//! Tracer collaborator: observational callbacks for model calls, tool
//! dispatches and sub-agent delegations.
//!
//! Tracers never influence control flow: `record` cannot fail and its
//! return value is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::provider::Usage;
use crate::summary::ExecutionSummary;

/// Everything a tracer can be told about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    /// A top-level or nested run began
    RunStarted {
        run_id: String,
        agent: String,
        depth: u32,
        timestamp: DateTime<Utc>,
    },

    /// One model call finished (successfully or not)
    ModelCall {
        run_id: String,
        model: String,
        iteration: u32,
        forced_final: bool,
        success: bool,
        duration_ms: u64,
        usage: Option<Usage>,
        timestamp: DateTime<Utc>,
    },

    /// One tool dispatch finished
    ToolDispatched {
        run_id: String,
        tool_name: String,
        call_id: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A sub-agent delegation finished
    SubAgentDelegated {
        run_id: String,
        parent: String,
        child: String,
        depth: u32,
        invocation_id: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A run reached a terminal state
    RunFinished {
        run_id: String,
        success: bool,
        summary: ExecutionSummary,
        timestamp: DateTime<Utc>,
    },
}

impl TraceEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::ModelCall { run_id, .. }
            | Self::ToolDispatched { run_id, .. }
            | Self::SubAgentDelegated { run_id, .. }
            | Self::RunFinished { run_id, .. } => run_id,
        }
    }
}

/// Receives trace callbacks. Must be cheap and non-blocking.
pub trait Tracer: Send + Sync {
    fn record(&self, event: TraceEvent);
}

/// A tracer that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn record(&self, _event: TraceEvent) {}
}

/// A broadcast-based event bus for trace events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<TraceEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: TraceEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TraceEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Tracer for EventBus {
    fn record(&self, event: TraceEvent) {
        self.publish(event);
    }
}

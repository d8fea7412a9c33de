//! Per-invocation context: cancellation, deadline, recursion depth and
//! caller-supplied values, passed by value down the call tree.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, ToolError};
use crate::stream::StreamEvent;

/// Maximum number of nested sub-agent delegations along one call chain.
pub const MAX_RECURSION_DEPTH: u32 = 5;

/// Where the current invocation sits in the delegation tree.
///
/// Depth 0 is a top-level run. Each delegation produces a new context one
/// level deeper; an existing context is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecursionContext {
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
}

impl RecursionContext {
    pub fn root() -> Self {
        Self::default()
    }

    /// Context for a delegation from `parent` to `child`.
    ///
    /// The caller's own depth is checked against `max`; a delegation from
    /// depth `max` is still allowed and runs at `max + 1`. Fails without side
    /// effects when the caller is already past `max`.
    pub fn descend(&self, parent: &str, child: &str, max: u32) -> Result<Self, ToolError> {
        if self.depth > max {
            return Err(ToolError::RecursionLimit {
                depth: self.depth,
                max,
            });
        }
        Ok(Self {
            depth: self.depth + 1,
            parent_name: Some(parent.to_string()),
            child_name: Some(child.to_string()),
            invocation_id: Some(Uuid::new_v4().to_string()),
        })
    }
}

/// Sink for relaying events from a nested run to the caller's stream.
pub type EventForwarder = mpsc::Sender<StreamEvent>;

/// Everything a run inherits from whoever started it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    recursion: RecursionContext,
    values: HashMap<String, serde_json::Value>,
    forwarder: Option<EventForwarder>,
}

impl InvocationContext {
    /// A root context: depth 0, no deadline, fresh cancellation token.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            recursion: RecursionContext::root(),
            values: HashMap::new(),
            forwarder: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Remove the deadline while keeping the cancellation signal.
    pub fn without_deadline(mut self) -> Self {
        self.deadline = None;
        self
    }

    pub fn with_recursion(mut self, recursion: RecursionContext) -> Self {
        self.recursion = recursion;
        self
    }

    /// Attach a caller value (tenant id, request id, ...).
    pub fn with_value(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_forwarder(mut self, forwarder: EventForwarder) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn without_forwarder(mut self) -> Self {
        self.forwarder = None;
        self
    }

    /// A context for nested work: same values, deadline and depth, with a
    /// child token so cancelling this context also cancels the child.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            recursion: self.recursion.clone(),
            values: self.values.clone(),
            forwarder: None,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn recursion(&self) -> &RecursionContext {
        &self.recursion
    }

    pub fn value(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn forwarder(&self) -> Option<&EventForwarder> {
        self.forwarder.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Fail fast if the run should not continue.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            return Err(Error::Cancelled("cancelled by caller".into()));
        }
        if self.is_expired() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the cancellation token fires.
    pub async fn cancelled(&self) -> Error {
        self.cancel.cancelled().await;
        Error::Cancelled("cancelled by caller".into())
    }

    /// Resolves once the token fires or the deadline passes.
    pub async fn done(&self) -> Error {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.cancel.cancelled() => Error::Cancelled("cancelled by caller".into()),
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => self.cancelled().await,
        }
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

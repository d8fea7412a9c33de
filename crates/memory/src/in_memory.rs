//! In-memory backend: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{ConversationMemory, MessageFilter};
use toolweave_core::message::Message;
use tracing::debug;

/// An in-memory backend that keeps messages in a Vec, in arrival order.
///
/// Clones share the same storage, so a test can hand one clone to an
/// orchestrator and inspect the audit trail through another.
#[derive(Clone)]
pub struct InMemoryHistory {
    messages: Arc<RwLock<Vec<Message>>>,
    capacity: Option<usize>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            capacity: None,
        }
    }

    /// Keep at most `capacity` messages, dropping the oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            messages: Arc::new(RwLock::new(Vec::new())),
            capacity: Some(capacity),
        }
    }

    /// Seed the history with existing messages.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
            capacity: None,
        }
    }

    pub async fn len(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.messages.read().await.is_empty()
    }

    /// Snapshot of everything stored.
    pub async fn snapshot(&self) -> Vec<Message> {
        self.messages.read().await.clone()
    }
}

impl Default for InMemoryHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationMemory for InMemoryHistory {
    fn name(&self) -> &str { "in_memory" }

    async fn add_message(&self, message: Message) -> Result<(), MemoryError> {
        let mut messages = self.messages.write().await;
        messages.push(message);
        if let Some(capacity) = self.capacity
            && messages.len() > capacity
        {
            let overflow = messages.len() - capacity;
            messages.drain(..overflow);
            debug!(dropped = overflow, "In-memory history trimmed to capacity");
        }
        Ok(())
    }

    async fn get_messages(&self, filter: &MessageFilter) -> Result<Vec<Message>, MemoryError> {
        let messages = self.messages.read().await;
        Ok(filter.apply(&messages))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        self.messages.write().await.clear();
        Ok(())
    }
}

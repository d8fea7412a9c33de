//! No-op memory backend: runs start from an empty history and nothing is kept.

use async_trait::async_trait;
use toolweave_core::error::MemoryError;
use toolweave_core::memory::{ConversationMemory, MessageFilter};
use toolweave_core::message::Message;

/// A no-op memory backend that stores nothing.
pub struct NoopHistory;

#[async_trait]
impl ConversationMemory for NoopHistory {
    fn name(&self) -> &str { "none" }

    async fn add_message(&self, _message: Message) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn get_messages(&self, _filter: &MessageFilter) -> Result<Vec<Message>, MemoryError> {
        Ok(Vec::new())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

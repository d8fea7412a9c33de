//! Memory trait: where conversation turns are persisted between runs.
//!
//! The orchestrator seeds each run from `get_messages` and writes every
//! turn back through `add_message`. Storage strategy is up to the
//! implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::message::{Message, Role};

/// Which stored messages to return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFilter {
    /// Keep only the most recent `limit` messages (after role filtering)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Keep only these roles; empty means all roles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<Role>,
}

impl MessageFilter {
    /// The most recent `limit` messages of any role.
    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            roles: Vec::new(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = Role>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.roles.is_empty() || self.roles.contains(&message.role)
    }

    /// Apply the filter to a chronological slice, preserving order.
    pub fn apply(&self, messages: &[Message]) -> Vec<Message> {
        let matched: Vec<&Message> = messages.iter().filter(|m| self.matches(m)).collect();
        let skip = match self.limit {
            Some(limit) => matched.len().saturating_sub(limit),
            None => 0,
        };
        matched.into_iter().skip(skip).cloned().collect()
    }
}

/// The conversation memory collaborator.
///
/// Implementations: in-memory (for tests and ephemeral sessions), none (no-op).
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// The backend name (e.g., "in_memory", "none").
    fn name(&self) -> &str;

    /// Append a message to the stored history.
    async fn add_message(&self, message: Message) -> std::result::Result<(), MemoryError>;

    /// Read stored messages in chronological order.
    async fn get_messages(
        &self,
        filter: &MessageFilter,
    ) -> std::result::Result<Vec<Message>, MemoryError>;

    /// Remove all stored messages.
    async fn clear(&self) -> std::result::Result<(), MemoryError>;
}

//! # toolweave Core
//!
//! Domain types, collaborator traits and error definitions for the toolweave
//! orchestration runtime. This crate holds no orchestration logic; it defines
//! the model every other crate implements against.
//!
//! ## Collaborators
//!
//! - [`Provider`]: the model backend (blocking and streaming)
//! - [`Tool`]: a named capability, held in a closed [`ToolRegistry`]
//! - [`ConversationMemory`]: where turns are persisted between runs
//! - [`Tracer`]: observational callbacks, never part of control flow

pub mod context;
pub mod error;
pub mod memory;
pub mod message;
pub mod provider;
pub mod stream;
pub mod summary;
pub mod tool;
pub mod trace;

// Re-export key types at crate root for ergonomics
pub use context::{EventForwarder, InvocationContext, MAX_RECURSION_DEPTH, RecursionContext};
pub use error::{Error, MemoryError, ProviderError, Result, ToolError};
pub use memory::{ConversationMemory, MessageFilter};
pub use message::{Conversation, ConversationId, Message, Role, ToolCallRequest};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolCallDelta,
    ToolDefinition, Usage,
};
pub use stream::{StreamEvent, StreamEventType};
pub use summary::ExecutionSummary;
pub use tool::{Tool, ToolOutput, ToolRegistry, ToolResult};
pub use trace::{EventBus, NoopTracer, TraceEvent, Tracer};

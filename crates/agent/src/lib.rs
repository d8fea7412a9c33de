//! The orchestration loop: the heart of toolweave.
//!
//! A run follows a **call → dispatch → observe** cycle:
//!
//! 1. **Seed** the conversation (system prompt + recent memory + user prompt)
//! 2. **Call the model** with the tool catalogue, retrying transient failures
//! 3. **If tool calls**: dispatch them serially, append results, loop back to step 2
//! 4. **If text only**: that is the answer
//!
//! When the iteration budget runs out the model gets one last call with no
//! tools and an instruction to answer from what it has. Runs can stream
//! their progress as [`toolweave_core::StreamEvent`]s, and any orchestrator
//! can be handed to another as a tool via [`SubAgentTool`].

pub mod delegator;
pub mod dispatcher;
pub mod guard;
pub mod orchestrator;
pub mod retry;
pub mod stream;

#[cfg(test)]
mod test_helpers;

pub use delegator::SubAgentTool;
pub use dispatcher::{BATCH_TOOL_NAME, ToolDispatcher, record_result};
pub use guard::RepetitionGuard;
pub use orchestrator::{AGENT_KEY, Orchestrator, RUN_ID_KEY, RunOutput};
pub use retry::{backoff_delay, retry_with_backoff};
pub use stream::EventStream;
pub use toolweave_config::{DeadlinePolicy, OrchestratorConfig};

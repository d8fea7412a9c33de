//! Error types for the toolweave domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum; [`Error`] is what a
//! top-level `run` hands back to its caller.

use thiserror::Error;

/// The top-level error type for all toolweave operations.
///
/// Every variant here is fatal for the run that produced it. Recoverable
/// failures (a missing tool, a tool that errored) never reach this type;
/// they are folded into tool-result content instead.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Provider call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    // --- Memory errors ---
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    // --- Delegation errors ---
    #[error("Recursion limit exceeded: depth {depth} is above the maximum of {max}")]
    RecursionLimit { depth: u32, max: u32 },

    // --- Cancellation ---
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Run deadline exceeded")]
    DeadlineExceeded,

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A short machine-readable label, used in stream event metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(_) => "provider",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Memory(_) => "memory",
            Self::RecursionLimit { .. } => "recursion_limit",
            Self::Cancelled(_) => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Config { .. } => "config",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error came from cancellation or a deadline rather than a fault.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::DeadlineExceeded)
    }
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. }
            | Self::StreamInterrupted(_)
            | Self::Timeout(_)
            | Self::Network(_) => true,
            Self::ApiError { status_code, .. } => {
                *status_code >= 500 || *status_code == 408 || *status_code == 429
            }
            Self::AuthenticationFailed(_) | Self::ModelNotFound(_) | Self::NotConfigured(_) => {
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Recursion limit exceeded: depth {depth} is above the maximum of {max}")]
    RecursionLimit { depth: u32, max: u32 },

    #[error("Tool cancelled: {0}")]
    Cancelled(String),
}

impl ToolError {
    /// Convert a fatal tool error into the run-level error it must abort with.
    ///
    /// Returns `None` for recoverable errors, which the dispatcher reports
    /// back to the model as tool-result content.
    pub fn into_fatal(self) -> Option<Error> {
        match self {
            Self::RecursionLimit { depth, max } => Some(Error::RecursionLimit { depth, max }),
            Self::Cancelled(reason) => Some(Error::Cancelled(reason)),
            _ => None,
        }
    }

    /// Whether this error must abort the run instead of being surfaced to the model.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RecursionLimit { .. } | Self::Cancelled(_))
    }
}

impl From<Error> for ToolError {
    /// Map a nested run failure onto the tool error seen by the parent.
    fn from(err: Error) -> Self {
        match err {
            Error::RecursionLimit { depth, max } => Self::RecursionLimit { depth, max },
            Error::Cancelled(reason) => Self::Cancelled(reason),
            other => Self::ExecutionFailed {
                tool_name: "sub_agent".into(),
                reason: other.to_string(),
            },
        }
    }
}

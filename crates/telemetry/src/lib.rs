//! Run tracing, usage accounting and logging setup for toolweave.
//!
//! [`TelemetryEngine`] is a [`toolweave_core::Tracer`]: hand it to an
//! orchestrator and every run becomes a [`Trace`] of spans (model calls,
//! tool dispatches, sub-agent delegations) with running token totals.

pub mod engine;
pub mod logging;
pub mod model;

pub use engine::TelemetryEngine;
pub use logging::{init_logging, try_init_logging};
pub use model::{Span, SpanKind, Trace, UsageSnapshot};

/// Errors from the telemetry subsystem.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("unknown trace id: {0}")]
    UnknownTrace(String),

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

//! Error taxonomy for the generation pipeline
//!
//! Every crate seam speaks `CopilotError`; leaf helpers that do not care
//! about the taxonomy keep using `anyhow::Result` internally.

use thiserror::Error;

/// Errors surfaced across component boundaries.
#[derive(Debug, Error)]
pub enum CopilotError {
    /// Unknown request or test id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Schema violation at ingest.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network failure, 5xx, rate-limit or deadline expiry. Retryable.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Parse failure after regeneration, missing credentials and other
    /// failures no retry can fix.
    #[error("permanent failure: {0}")]
    Permanent(String),

    /// Per-test rejection by the Safety Guard. Never fails a request.
    #[error("blocked by safety guard: {0}")]
    SafetyBlocked(String),

    /// Cooperative cancellation observed.
    #[error("request cancelled")]
    Cancelled,

    /// The stored workflow checkpoint could not be decoded.
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),

    /// Storage-layer failure.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CopilotError {
    /// Whether the stage retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, CopilotError::Transient(_))
    }
}

/// Crate-wide result alias.
pub type CopilotResult<T> = std::result::Result<T, CopilotError>;

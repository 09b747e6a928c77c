//! Error taxonomy for the session engine.
//!
//! Only persistence failures travel up to the caller. Verdict
//! evaluation and coherence analysis degrade to neutral values instead of
//! returning errors, so they have no variants here.

use uuid::Uuid;

/// Failures raised by a [`crate::store::DurableStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced by the orchestrator and the checkpoint service.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown phase '{0}'")]
    UnknownPhase(String),
    #[error("unknown theme '{0}'")]
    UnknownTheme(String),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("absolute session ceiling reached after {elapsed_ms} ms")]
    TimingViolation { elapsed_ms: i64 },
    #[error("session {0} not found")]
    UnknownSession(Uuid),
    #[error("session {0} is no longer active")]
    SessionInactive(Uuid),
    #[error("session {0} is already running")]
    SessionAlreadyActive(Uuid),
    #[error("no checkpoint stored for session {0}")]
    NoCheckpoint(Uuid),
}

impl EngineError {
    /// True for the configuration class of errors (unknown phase or theme).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnknownPhase(_) | Self::UnknownTheme(_))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

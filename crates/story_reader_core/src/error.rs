//! crates/story_reader_core/src/error.rs
//!
//! The engine's error taxonomy. Callers decide how each kind degrades.

use crate::ports::PortError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The tier or usage counters could not be resolved. Readers fall back to the guest ceiling.
    #[error("Entitlements unavailable: {0}")]
    EntitlementUnavailable(String),

    #[error("Auth provider unavailable: {0}")]
    AuthUnavailable(String),

    #[error("Auth session refresh failed: {0}")]
    AuthRefreshFailed(String),

    /// A session record could not be written; that interval's duration is lost.
    #[error("Failed to write reading session {session_id}: {reason}")]
    SessionWriteFailed { session_id: uuid::Uuid, reason: String },

    /// The grant already exists. Callers treat this as success.
    #[error("Achievement {0} was already granted")]
    AchievementGrantConflict(String),

    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

pub type EngineResult<T> = Result<T, EngineError>;

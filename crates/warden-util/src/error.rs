//! Error types for the usage-limit engine

use thiserror::Error;

/// Errors reported synchronously from registration and event APIs.
#[derive(Debug, Error)]
pub enum WardenError {
    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A per-uid observer cap was hit.
    #[error("observer quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The requested transition conflicts with current entity state.
    #[error("state conflict: {0}")]
    StateConflict(String),
}

impl WardenError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    pub fn state_conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;

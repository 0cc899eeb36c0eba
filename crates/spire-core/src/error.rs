//! Error types for the spire core.

use spire_types::api::ErrorCode;
use thiserror::Error;

/// Main error type for supervisor operations.
///
/// The variants follow the daemon's error taxonomy: user errors carry a
/// stable code and surface to the caller unchanged; stale-resource and
/// transient-peer conditions are handled where they occur and only reach
/// here when the caller must be told.
#[derive(Error, Debug)]
pub enum SpireError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("{message}")]
    NotFound {
        message: String,
        candidates: Vec<String>,
    },

    #[error("{message}")]
    Ambiguous {
        message: String,
        candidates: Vec<String>,
    },

    #[error("no project context: {0}")]
    NoContext(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("shellper holder failed to start: {0}")]
    HolderSpawnFailed(String),

    #[error("session store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpireError {
    pub fn not_found(message: impl Into<String>) -> Self {
        SpireError::NotFound { message: message.into(), candidates: Vec::new() }
    }

    /// The stable API error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SpireError::InvalidParams(_) => ErrorCode::InvalidParams,
            SpireError::NotFound { .. } => ErrorCode::NotFound,
            SpireError::Ambiguous { .. } => ErrorCode::Ambiguous,
            SpireError::NoContext(_) => ErrorCode::NoContext,
            SpireError::RateLimited(_) => ErrorCode::RateLimited,
            SpireError::HolderSpawnFailed(_)
            | SpireError::Store(_)
            | SpireError::Io(_)
            | SpireError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Candidate names attached to resolution failures, if any.
    pub fn candidates(&self) -> &[String] {
        match self {
            SpireError::NotFound { candidates, .. } | SpireError::Ambiguous { candidates, .. } => {
                candidates
            }
            _ => &[],
        }
    }
}

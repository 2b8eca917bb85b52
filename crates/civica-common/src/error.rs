//! Errors

use thiserror::Error;
use uuid::Uuid;

use crate::database;

/// Civica Error
#[derive(Debug, Error)]
pub enum Error {
    /// Resource lock could not be obtained within the caller's deadline
    #[error("Resource `{0}` is locked by another saga")]
    Locked(String),
    /// Concurrent modification detected
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Operation timeout
    #[error("Operation timeout")]
    Timeout,
    /// Caller-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,
    /// An authoritative step failed and the saga was rolled back
    #[error("Step `{step}` failed: {cause}")]
    StepFailed {
        /// Name of the failed step
        step: String,
        /// Failure description
        cause: String,
    },
    /// A compensation failed; the saga is preserved for operator resolution
    #[error("Compensation for step `{step}` failed: {cause}")]
    CompensationFailed {
        /// Name of the step whose compensation failed
        step: String,
        /// Failure description
        cause: String,
    },
    /// Backend unavailable
    #[error("Unavailable: {0}")]
    Unavailable(String),
    /// A saga with the same idempotency key is still running
    #[error("Operation already in progress: saga `{0}`")]
    InProgress(Uuid),
    /// No saga definition registered under this name and version
    #[error("Unknown saga definition `{0}` version `{1}`")]
    UnknownDefinition(String, u32),
    /// Saga context failed validation
    #[error("Invalid saga context: {0}")]
    InvalidContext(String),
    /// Referenced record does not exist
    #[error("Unknown record `{0}`")]
    UnknownRecord(String),
    /// Referenced draft does not exist
    #[error("Unknown draft `{0}`")]
    UnknownDraft(String),
    /// Version-control store error
    #[error("VCS error: {0}")]
    Vcs(String),
    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Database Error
    #[error(transparent)]
    Database(#[from] database::Error),
    /// Serde Error
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    /// Frontmatter Error
    #[error(transparent)]
    Frontmatter(#[from] serde_yaml::Error),
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a retry within the same step may succeed.
    ///
    /// Transient classification drives the per-step retry policy; permanent
    /// failures surface to the executor and trigger compensation.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) => true,
            Self::Database(db) => db.is_transient(),
            Self::Vcs(msg) => msg.contains("index locked") || msg.contains("lock"),
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

//! Engine error types

use thiserror::Error;

/// Errors crossing the backend boundary.
///
/// Backend-internal failures are converted to one of these at the boundary;
/// the orchestrator decides recoverability (fallback vs. surface-to-user).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Backend could not be brought up; the kind is unavailable this session
    #[error("backend initialization failed: {0}")]
    InitFailed(String),

    /// Operation called before `initialize` (programming error)
    #[error("operation called before initialize")]
    NotInitialized,

    /// Worker never acknowledged a module load within the timeout
    #[error("worker did not acknowledge module load in time")]
    LoadTimeout,

    /// Failure reported from inside a running backend
    #[error("backend failure: {0}")]
    Backend(String),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

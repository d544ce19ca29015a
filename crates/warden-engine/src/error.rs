//! Engine error types.

use thiserror::Error;

/// Errors raised by the engine and its supervisor.
///
/// `Clone` so the last error can be kept in the process state and handed
/// out to status queries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The tunnel set could not be serialised into an engine configuration.
    #[error("Invalid engine configuration: {0}")]
    ConfigInvalid(String),

    /// The OS could not create the engine process.
    #[error("Failed to launch engine: {0}")]
    LaunchFailed(String),

    /// The engine process could not be signalled or did not exit.
    #[error("Failed to terminate engine: {0}")]
    TerminateFailed(String),

    /// Reading the engine's traffic counters failed.
    #[error("Failed to pull traffic stats: {0}")]
    StatsPullFailed(String),

    /// The operation needs a running engine.
    #[error("Engine is not running")]
    NotRunning,

    /// The engine exited without being asked to.
    #[error("Engine exited: {0}")]
    Exited(String),

    /// Reading tunnel records failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<warden_storage::StorageError> for EngineError {
    fn from(e: warden_storage::StorageError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

//! Network error types.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors raised while setting up listeners.
#[derive(Debug, Error)]
pub enum NetError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    Bind(SocketAddr, std::io::Error),

    /// Certificate or key could not be loaded.
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

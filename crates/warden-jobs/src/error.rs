//! Job error types.

use thiserror::Error;

/// Errors raised while registering scheduled tasks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The schedule expression is not understood.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

/// Errors raised while sending notifications.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Transport error talking to the bot API.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The bot API answered with an error.
    #[error("Rejected by bot API: {0}")]
    Rejected(String),

    /// Token or chat id missing.
    #[error("Notifier not configured: {0}")]
    NotConfigured(String),
}

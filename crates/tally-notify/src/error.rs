//! Notification error types.

use thiserror::Error;

/// Errors raised by the notification subsystem.
///
/// None of these reach an HTTP caller that triggered a change; the notifier
/// logs and swallows them. They surface only at startup (opening the store)
/// and inside the change-feed listener's retry loop.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// Timestamp store error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A persisted timestamp could not be decoded.
    #[error("corrupt timestamp: {0}")]
    CorruptTimestamp(String),

    /// Upstream change feed error.
    #[error("change feed error: {0}")]
    Feed(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

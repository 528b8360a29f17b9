//! Keyward error types
//!
//! Expected negative results (rate limited, quota exhausted, upload
//! conflicts) are *not* errors; they are returned as plain values. Variants
//! here describe collaborator failures and configuration problems.

use std::time::Duration;

/// Keyward error types
#[derive(Debug, thiserror::Error)]
pub enum KeywardError {
    // Collaborator errors
    #[error("failed to resolve link for file {file_id}: {message}")]
    Resolve { file_id: String, message: String },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("remote rate limited, retry after {retry_after:?}")]
    RemoteRateLimited { retry_after: Option<Duration> },

    #[error("store '{store}' failed: {message}")]
    Store { store: String, message: String },

    // Data errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credits not initialized for {0}")]
    CreditsNotInitialized(String),
}

impl KeywardError {
    /// Whether retrying the same call may succeed.
    ///
    /// Used by [`RetryingLinkResolver`](crate::upload::RetryingLinkResolver)
    /// to decide between another attempt and an immediate failure.
    pub fn is_transient(&self) -> bool {
        match self {
            KeywardError::Resolve { .. }
            | KeywardError::RemoteRateLimited { .. }
            | KeywardError::Store { .. } => true,
            KeywardError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            KeywardError::RemoteRateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn store(store: &str, message: impl Into<String>) -> Self {
        KeywardError::Store {
            store: store.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for Keyward operations
pub type Result<T> = std::result::Result<T, KeywardError>;

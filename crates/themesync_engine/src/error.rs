//! Error types for the sync engine.

use std::time::Duration;
use themesync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The environment configuration is missing or invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An ignore pattern could not be compiled.
    #[error("invalid ignore pattern {pattern:?}: {reason}")]
    IgnoreRule {
        /// The offending entry.
        pattern: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The store answered with an unexpected status.
    #[error("store returned {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error detail from the body, if any.
        message: String,
    },

    /// The store is throttling requests.
    #[error("rate limited by store")]
    RateLimited {
        /// Delay requested by the store through `Retry-After`.
        retry_after: Option<Duration>,
    },

    /// The credential was rejected.
    #[error("authentication failed ({status}): {message}")]
    Unauthorized {
        /// 401 or 403.
        status: u16,
        /// Error detail from the body, if any.
        message: String,
    },

    /// The requested theme or asset does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Request timed out.
    #[error("operation timed out")]
    Timeout,

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Too many consecutive authentication failures.
    #[error("aborting after {failures} consecutive authentication failures")]
    AuthEscalation {
        /// Number of failures in the run that triggered the abort.
        failures: u32,
    },

    /// Local filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed key, checksum or API body.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The last-synced ledger could not be read or written.
    #[error("ledger error: {0}")]
    Ledger(String),

    /// The filesystem watcher failed.
    #[error("watch error: {0}")]
    Watch(String),

    /// A session task panicked or was aborted.
    #[error("session task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::RateLimited { .. } => true,
            SyncError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns true if the credential was rejected.
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Unauthorized { .. })
    }

    /// Returns true if this error ends the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Config(_)
                | SyncError::IgnoreRule { .. }
                | SyncError::Unauthorized { .. }
                | SyncError::AuthEscalation { .. }
        )
    }

    /// Returns the store-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection reset").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());
        assert!(SyncError::Http {
            status: 502,
            message: "bad gateway".into()
        }
        .is_retryable());
        assert!(!SyncError::Http {
            status: 422,
            message: "invalid".into()
        }
        .is_retryable());
        assert!(!SyncError::NotFound("x".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_and_auth_classification() {
        let auth = SyncError::Unauthorized {
            status: 401,
            message: "Invalid API key".into(),
        };
        assert!(auth.is_auth());
        assert!(auth.is_fatal());
        assert!(!auth.is_retryable());

        assert!(SyncError::config("missing password").is_fatal());
        assert!(SyncError::AuthEscalation { failures: 3 }.is_fatal());
        assert!(!SyncError::Timeout.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::config("missing password");
        assert_eq!(err.to_string(), "invalid configuration: missing password");

        let err = SyncError::IgnoreRule {
            pattern: "[a".into(),
            reason: "unclosed".into(),
        };
        assert!(err.to_string().contains("\"[a\""));

        let err = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}

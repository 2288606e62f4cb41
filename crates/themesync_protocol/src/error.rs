//! Error types for protocol values.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while building or decoding protocol values.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The asset key is empty, absolute, or escapes the theme root.
    #[error("invalid asset key {key:?}: {reason}")]
    InvalidKey {
        /// The offending key.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A checksum was not a hex string.
    #[error("invalid checksum {0:?}")]
    InvalidChecksum(String),

    /// A request or response body could not be (de)serialized.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A binary attachment was not valid base64.
    #[error("attachment decode error: {0}")]
    Attachment(#[from] base64::DecodeError),
}

impl ProtocolError {
    pub(crate) fn invalid_key(key: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidKey {
            key: key.into(),
            reason,
        }
    }
}

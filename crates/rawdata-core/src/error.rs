//! Error types shared by the rawdata migration crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by keys, manifests and the payload cipher.
#[derive(Error, Debug)]
pub enum Error {
    /// Encoded key bytes could not be decoded against the schema.
    #[error("key codec error: {0}")]
    KeyCodec(String),

    /// A key could not be built from the supplied values.
    #[error("invalid key field '{field}': {reason}")]
    InvalidKey {
        /// The offending field name.
        field: String,
        /// Description of what's wrong.
        reason: String,
    },

    /// Encryption or decryption failed.
    #[error("cipher error: {0}")]
    Cipher(String),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn invalid_key(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidKey {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

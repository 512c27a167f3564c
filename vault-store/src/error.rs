//! Error types for vault-store.

use vault_crypto::CryptoError;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A referenced row does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Table or entity name.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// A row's columns violate the envelope/plaintext exclusivity rule or
    /// hold values that cannot be decoded.
    #[error("corrupt row: {reason}")]
    CorruptRow {
        /// What was wrong.
        reason: String,
    },

    /// Envelope or salt columns had the wrong shape.
    #[error("envelope error: {0}")]
    Envelope(#[from] CryptoError),

    /// Settings blob could not be parsed or written.
    #[error("settings serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Object store key not present.
    #[error("object not found: {key}")]
    ObjectNotFound {
        /// The missing key.
        key: String,
    },

    /// Object store key rejected (path traversal, empty, absolute).
    #[error("invalid object key: {key}")]
    InvalidObjectKey {
        /// The rejected key.
        key: String,
    },

    /// Filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),
}

impl StorageError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            reason: reason.into(),
        }
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

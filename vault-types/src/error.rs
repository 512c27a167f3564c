//! Error types for vault-types.

use thiserror::Error;

/// Errors raised while constructing or parsing shared types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    /// User identifiers must be non-empty.
    #[error("user id must not be empty")]
    EmptyUserId,

    /// A row identifier was not a valid UUID.
    #[error("invalid {kind} id: {value}")]
    InvalidId {
        /// Which identifier was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },

    /// Key versions start at 1.
    #[error("invalid key version: {0}")]
    InvalidKeyVersion(i64),

    /// No version remains after `u32::MAX`.
    #[error("key version space exhausted")]
    VersionExhausted,
}

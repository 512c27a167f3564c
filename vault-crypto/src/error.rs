//! Error types for vault-crypto.

use thiserror::Error;

/// Crypto errors.
///
/// Variants never carry key material, salts, or plaintext.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Envelope fields had the wrong count, length, or encoding.
    /// Raised before any cipher operation is attempted.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong with the input.
        reason: String,
    },

    /// Authentication failed: wrong key, tampered or truncated data.
    /// No details provided to prevent oracle attacks.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length.
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Salt rejected before running the KDF.
    #[error("invalid salt length: expected {expected}, got {actual}")]
    InvalidSalt {
        /// Required length (exact for per-user salts, minimum for the global salt).
        expected: usize,
        /// Actual length.
        actual: usize,
    },

    /// Key derivation failed.
    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    /// The OS random source failed.
    #[error("random number generation failed: {0}")]
    Rng(String),
}

impl CryptoError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedEnvelope {
            reason: reason.into(),
        }
    }
}

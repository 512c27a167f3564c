//! Error types for vault-service.

use vault_crypto::CryptoError;
use vault_store::StorageError;
use vault_types::UserId;

/// Errors surfaced by the key ring, rotation engine and facades.
///
/// `Display` output never contains key material, salts, or plaintext.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Wrong field count, length or encoding on decode. Operator error;
    /// the cipher was never run.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong.
        reason: String,
    },

    /// Authentication tag mismatch or wrong key.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Per-user operation for a user with no key metadata, or for a key
    /// version whose salt is not on record.
    #[error("no key provisioned for user {user}")]
    KeyNotProvisioned {
        /// The user.
        user: UserId,
    },

    /// Rotation stopped before every row was migrated. The key metadata was
    /// not flipped; re-invoking rotation resumes.
    #[error("rotation incomplete for user {user} after {migrated} rows: {reason}")]
    RotationIncomplete {
        /// The user.
        user: UserId,
        /// Rows migrated by this attempt before it stopped.
        migrated: u64,
        /// What stopped it.
        reason: String,
    },

    /// Another rotation for the same user is running in this process.
    #[error("rotation already in progress for user {user}")]
    RotationInProgress {
        /// The user.
        user: UserId,
    },

    /// Master secret or credential salt absent at startup.
    #[error("configuration missing: {field}")]
    ConfigurationMissing {
        /// Config key that was missing or empty.
        field: &'static str,
    },

    /// A secret is present at startup but unusable.
    #[error("configuration invalid: {field}: {reason}")]
    ConfigurationInvalid {
        /// Config key that was rejected.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// A referenced thread, message or attachment does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity name.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(StorageError),

    /// Crypto failure outside the taxonomy (RNG, KDF, salt shape).
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Message body could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    /// Stable error kind for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::MalformedEnvelope { .. } => "malformed_envelope",
            VaultError::DecryptionFailed => "decryption_failed",
            VaultError::KeyNotProvisioned { .. } => "key_not_provisioned",
            VaultError::RotationIncomplete { .. } => "rotation_incomplete",
            VaultError::RotationInProgress { .. } => "rotation_in_progress",
            VaultError::ConfigurationMissing { .. } => "configuration_missing",
            VaultError::ConfigurationInvalid { .. } => "configuration_invalid",
            VaultError::NotFound { .. } => "not_found",
            VaultError::Storage(_) => "storage",
            VaultError::Crypto(_) => "crypto",
            VaultError::Serialization(_) => "serialization",
        }
    }

    /// Whether a bulk read should show a placeholder for this row instead
    /// of failing the whole read.
    pub fn is_row_unavailable(&self) -> bool {
        matches!(
            self,
            VaultError::DecryptionFailed | VaultError::KeyNotProvisioned { .. }
        )
    }

    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        VaultError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<CryptoError> for VaultError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::MalformedEnvelope { reason } => VaultError::MalformedEnvelope { reason },
            CryptoError::DecryptionFailed => VaultError::DecryptionFailed,
            other => VaultError::Crypto(other),
        }
    }
}

impl From<StorageError> for VaultError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Envelope(crypto) => crypto.into(),
            StorageError::NotFound { kind, id } => VaultError::NotFound { kind, id },
            other => VaultError::Storage(other),
        }
    }
}

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

//! Row types shared by the storage traits and backends.

use std::time::{SystemTime, UNIX_EPOCH};
use vault_crypto::{CryptoError, Envelope, Salt, IV_SIZE, TAG_SIZE};
use vault_types::{AttachmentId, KeyVersion, MessageId, ThreadId, UserId};

use crate::error::{StorageError, StorageResult};

/// Current Unix time in seconds.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-user key metadata: the salt and version new ciphertext is sealed under.
#[derive(Debug, Clone)]
pub struct KeyMeta {
    /// Owner.
    pub user_id: UserId,
    /// Current salt. Historical salts live in the key history table.
    pub salt: Salt,
    /// Current version.
    pub version: KeyVersion,
    /// Unix timestamp of the last completed rotation.
    pub rotated_at: Option<i64>,
}

/// An envelope together with the key version it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedRecord {
    /// IV, ciphertext and tag.
    pub envelope: Envelope,
    /// Version whose salt derives the key for this envelope.
    pub key_version: KeyVersion,
}

/// A stored value: sealed, or a legacy plaintext row written before
/// encryption existed. The two representations never coexist on one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored<T> {
    /// Envelope columns populated, plaintext column null.
    Sealed(SealedRecord),
    /// Plaintext column populated, envelope columns null.
    Plaintext(T),
}

impl<T> Stored<T> {
    /// Decode the envelope columns and legacy column of one row.
    ///
    /// All four envelope columns must be present together, and only when the
    /// legacy column is null. Anything else is a corrupt row.
    pub fn from_columns(
        iv: Option<Vec<u8>>,
        ciphertext: Option<Vec<u8>>,
        auth_tag: Option<Vec<u8>>,
        key_version: Option<i64>,
        legacy: Option<T>,
    ) -> StorageResult<Self> {
        match (iv, ciphertext, auth_tag, key_version, legacy) {
            (Some(iv), Some(ciphertext), Some(auth_tag), Some(version), None) => {
                let envelope = Envelope::from_parts(&iv, ciphertext, &auth_tag)?;
                let key_version = KeyVersion::from_i64(version)
                    .map_err(|e| StorageError::corrupt(e.to_string()))?;
                Ok(Stored::Sealed(SealedRecord {
                    envelope,
                    key_version,
                }))
            }
            (None, None, None, None, Some(plaintext)) => Ok(Stored::Plaintext(plaintext)),
            (_, _, _, _, Some(_)) => Err(StorageError::corrupt(
                "row has both envelope and plaintext columns",
            )),
            (None, None, None, None, None) => {
                Err(StorageError::corrupt("row has neither envelope nor plaintext"))
            }
            _ => Err(StorageError::corrupt("row has a partial envelope")),
        }
    }

    /// Key version of a sealed row.
    pub fn key_version(&self) -> Option<KeyVersion> {
        match self {
            Stored::Sealed(record) => Some(record.key_version),
            Stored::Plaintext(_) => None,
        }
    }
}

/// A chat thread row.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    /// Thread id.
    pub id: ThreadId,
    /// Owner, whose key protects every message in the thread.
    pub user_id: UserId,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: i64,
    /// Last message time; a liveness hint for thread lists.
    pub last_message_at: Option<i64>,
}

/// A message row as read from storage.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Message id.
    pub id: MessageId,
    /// Parent thread.
    pub thread_id: ThreadId,
    /// Creation time.
    pub created_at: i64,
    /// Sealed body, or the legacy JSON body.
    pub body: Stored<String>,
}

/// A message about to be inserted. Always sealed: the write path never
/// produces plaintext rows.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Message id.
    pub id: MessageId,
    /// Parent thread; its `last_message_at` is touched in the same transaction.
    pub thread_id: ThreadId,
    /// Creation time.
    pub created_at: i64,
    /// Sealed body.
    pub sealed: SealedRecord,
}

/// Overwrite one message's envelope columns.
#[derive(Debug, Clone)]
pub struct MessageReseal {
    /// Row to update.
    pub id: MessageId,
    /// The version the row must still be on for the update to apply;
    /// `None` means the row must still be a legacy plaintext row.
    pub previous_version: Option<KeyVersion>,
    /// New envelope and version.
    pub sealed: SealedRecord,
}

/// Envelope fields kept on an attachment row; the ciphertext itself lives
/// in the object store under `object_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// IV used for the object bytes.
    pub iv: [u8; IV_SIZE],
    /// GCM tag over the object bytes.
    pub auth_tag: [u8; TAG_SIZE],
    /// Version whose salt derives the key.
    pub key_version: KeyVersion,
}

impl EnvelopeHeader {
    /// Build a header from stored columns.
    ///
    /// Returns `MalformedEnvelope` if the IV or tag is not exactly 16 bytes,
    /// the same as a message row's envelope columns.
    pub fn from_parts(
        iv: &[u8],
        auth_tag: &[u8],
        key_version: KeyVersion,
    ) -> Result<Self, CryptoError> {
        let envelope = Envelope::from_parts(iv, Vec::new(), auth_tag)?;
        Ok(Self {
            iv: envelope.iv,
            auth_tag: envelope.auth_tag,
            key_version,
        })
    }

    /// Split a sealed envelope into its header and ciphertext.
    pub fn split(sealed: SealedRecord) -> (Self, Vec<u8>) {
        let SealedRecord {
            envelope,
            key_version,
        } = sealed;
        let header = Self {
            iv: envelope.iv,
            auth_tag: envelope.auth_tag,
            key_version,
        };
        (header, envelope.ciphertext)
    }

    /// Rejoin a header with ciphertext fetched from the object store.
    pub fn join(&self, ciphertext: Vec<u8>) -> Envelope {
        Envelope {
            iv: self.iv,
            ciphertext,
            auth_tag: self.auth_tag,
        }
    }
}

/// Whether an attachment's object bytes are sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentProtection {
    /// `is_encrypted = 1`, header columns populated.
    Encrypted(EnvelopeHeader),
    /// Legacy upload stored in clear.
    Plaintext,
}

/// An attachment row.
#[derive(Debug, Clone)]
pub struct AttachmentRecord {
    /// Attachment id.
    pub id: AttachmentId,
    /// Thread the file was uploaded to.
    pub thread_id: ThreadId,
    /// Owner.
    pub user_id: UserId,
    /// Object store key holding the (possibly sealed) bytes.
    pub object_key: String,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub content_type: String,
    /// Plaintext size in bytes.
    pub size: u64,
    /// Upload time.
    pub created_at: i64,
    /// Sealed or legacy plaintext.
    pub protection: AttachmentProtection,
}

/// Point an attachment row at freshly sealed object bytes.
#[derive(Debug, Clone)]
pub struct AttachmentReseal {
    /// Row to update.
    pub id: AttachmentId,
    /// The version the row must still be on (`None`: still plaintext).
    pub previous_version: Option<KeyVersion>,
    /// Object key of the new ciphertext.
    pub object_key: String,
    /// New header.
    pub header: EnvelopeHeader,
}

//! # vault-store
//!
//! Storage for chatvault ciphertext and key metadata.
//!
//! The relational store is consumed through narrow async traits so that the
//! key ring, rotation engine and facades can be tested against doubles:
//!
//! - [`KeyMetaStore`] - current `{salt, version}` per user plus the
//!   append-only `{user, version, salt}` history
//! - [`MessageStore`] - threads and sealed/legacy message rows
//! - [`AttachmentStore`] - attachment rows (envelope header only)
//! - [`SettingsStore`] - per-user settings blob holding encrypted credentials
//! - [`ObjectStore`] - blob get/put/delete for attachment bytes
//!
//! [`SqliteStorage`] implements the four row traits; [`MemoryObjectStore`]
//! and [`FsObjectStore`] implement the object store.
//!
//! ## Row Layout
//!
//! ```text
//! messages:     id | thread_id | created_at | body (legacy) | iv | ciphertext | auth_tag | key_version
//! attachments:  id | ... | object_key | is_encrypted | iv | auth_tag | key_version
//! key_meta:     user_id (unique) | salt | version | rotated_at
//! key_history:  user_id | version | salt        (append-only, PK user_id+version)
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod model;
mod objects;
mod sqlite;

pub use error::{StorageError, StorageResult};
pub use model::{
    unix_timestamp, AttachmentProtection, AttachmentRecord, AttachmentReseal, EnvelopeHeader,
    KeyMeta, MessageReseal, NewMessage, SealedRecord, Stored, StoredMessage, ThreadRecord,
};
pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore};
pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use vault_crypto::Salt;
use vault_types::{AttachmentId, KeyVersion, MessageId, ThreadId, UserId};

/// Per-user key metadata and salt history.
#[async_trait]
pub trait KeyMetaStore: Send + Sync {
    /// Insert version 1 of a user's key metadata and its history row.
    ///
    /// Silently does nothing if the user already has key metadata; returns
    /// whether this call created it. Safe under concurrent first use.
    async fn insert_key_meta_if_absent(&self, user: &UserId, salt: &Salt) -> StorageResult<bool>;

    /// Current key metadata for a user.
    async fn get_key_meta(&self, user: &UserId) -> StorageResult<Option<KeyMeta>>;

    /// Salt recorded in history for a specific version.
    async fn get_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<Option<Salt>>;

    /// Record `candidate` as the salt for `version` unless one is already
    /// recorded, and return whichever salt is recorded.
    async fn reserve_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
        candidate: &Salt,
    ) -> StorageResult<Salt>;

    /// Compare-and-swap the current key metadata from `expected` to
    /// `{salt, new_version, rotated_at}`. Returns false if the stored
    /// version was not `expected`.
    async fn flip_key_meta(
        &self,
        user: &UserId,
        expected: KeyVersion,
        new_version: KeyVersion,
        salt: &Salt,
        rotated_at: i64,
    ) -> StorageResult<bool>;
}

/// Threads and message rows.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Create a thread.
    async fn create_thread(&self, thread: &ThreadRecord) -> StorageResult<()>;

    /// Look up a thread.
    async fn get_thread(&self, id: &ThreadId) -> StorageResult<Option<ThreadRecord>>;

    /// Insert a sealed message and touch the parent thread's
    /// `last_message_at` in one transaction.
    async fn insert_message(&self, message: &NewMessage) -> StorageResult<()>;

    /// Look up one message.
    async fn get_message(&self, id: &MessageId) -> StorageResult<Option<StoredMessage>>;

    /// Messages of a thread in insertion order, optionally limited.
    async fn list_messages(
        &self,
        thread: &ThreadId,
        limit: Option<u32>,
    ) -> StorageResult<Vec<StoredMessage>>;

    /// Up to `limit` sealed messages of the user's threads whose key version
    /// is below `version`.
    async fn sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<StoredMessage>>;

    /// Count sealed messages below `version`.
    async fn count_sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64>;

    /// Up to `limit` legacy plaintext messages of the user's threads.
    async fn legacy_messages(&self, user: &UserId, limit: u32) -> StorageResult<Vec<StoredMessage>>;

    /// Count legacy plaintext messages.
    async fn count_legacy_messages(&self, user: &UserId) -> StorageResult<u64>;

    /// Apply a batch of envelope overwrites in one transaction, clearing the
    /// legacy column. Rows no longer at `previous_version` are skipped.
    /// Returns the number of rows updated.
    async fn reseal_messages(&self, batch: &[MessageReseal]) -> StorageResult<u64>;
}

/// Attachment rows.
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Insert an attachment row.
    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> StorageResult<()>;

    /// Look up an attachment.
    async fn get_attachment(&self, id: &AttachmentId) -> StorageResult<Option<AttachmentRecord>>;

    /// Attachments of a thread.
    async fn list_attachments(&self, thread: &ThreadId) -> StorageResult<Vec<AttachmentRecord>>;

    /// Up to `limit` encrypted attachments of the user below `version`.
    async fn sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<AttachmentRecord>>;

    /// Count encrypted attachments below `version`.
    async fn count_sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64>;

    /// Apply a batch of header/object-key swaps in one transaction.
    /// Rows no longer at `previous_version` are skipped.
    async fn reseal_attachments(&self, batch: &[AttachmentReseal]) -> StorageResult<u64>;

    /// Delete an attachment row; returns whether it existed.
    async fn delete_attachment(&self, id: &AttachmentId) -> StorageResult<bool>;
}

/// Per-user settings blob. Credentials are stored under `apiKeys.<provider>`
/// in their colon-joined hex form.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Encoded credential for a provider.
    async fn get_credential(&self, user: &UserId, provider: &str) -> StorageResult<Option<String>>;

    /// Atomically replace the credential for a provider, leaving the rest of
    /// the settings blob untouched.
    async fn put_credential(&self, user: &UserId, provider: &str, encoded: &str) -> StorageResult<()>;

    /// Remove a provider's credential; returns whether it existed.
    async fn delete_credential(&self, user: &UserId, provider: &str) -> StorageResult<bool>;

    /// Providers with a stored credential, sorted.
    async fn credential_providers(&self, user: &UserId) -> StorageResult<Vec<String>>;
}

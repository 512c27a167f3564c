//! Shared fixtures for scenario tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chatvault_service::{Secrets, Vault, VaultStores};
use vault_crypto::{KdfParams, Salt};
use vault_store::{
    AttachmentRecord, AttachmentReseal, AttachmentStore, KeyMeta, KeyMetaStore,
    MemoryObjectStore, MessageReseal, MessageStore, NewMessage, SqliteStorage, StorageError,
    StorageResult, StoredMessage, ThreadRecord,
};
use vault_types::{AttachmentId, KeyVersion, MessageId, ThreadId, UserId};

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn secrets() -> Secrets {
    Secrets::new("scenario-master-secret", "scenario-credential-salt").unwrap()
}

/// A vault over one in-memory database, with handles to the raw stores.
pub struct Harness {
    pub vault: Vault,
    pub storage: Arc<SqliteStorage>,
    pub objects: MemoryObjectStore,
    pub messages: Arc<FlakyMessages>,
    pub attachments: Arc<FlakyAttachments>,
    pub key_meta: Arc<CountingKeyMeta>,
}

impl Harness {
    pub async fn new() -> Self {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let objects = MemoryObjectStore::new();
        let messages = Arc::new(FlakyMessages::new(storage.clone()));
        let attachments = Arc::new(FlakyAttachments::new(storage.clone()));
        let key_meta = Arc::new(CountingKeyMeta::new(storage.clone()));

        let stores = VaultStores {
            key_meta: key_meta.clone(),
            messages: messages.clone(),
            attachments: attachments.clone(),
            settings: storage.clone(),
            objects: Arc::new(objects.clone()),
        };
        let vault = Vault::new(&secrets(), KdfParams::for_tests(), stores).unwrap();

        Self {
            vault,
            storage,
            objects,
            messages,
            attachments,
            key_meta,
        }
    }
}

/// Message store that can fail the Nth `reseal_messages` call.
pub struct FlakyMessages {
    inner: Arc<SqliteStorage>,
    reseal_calls: AtomicUsize,
    fail_on_call: AtomicUsize,
}

impl FlakyMessages {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            reseal_calls: AtomicUsize::new(0),
            fail_on_call: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`th reseal call from now (1-based).
    pub fn fail_reseal_call(&self, n: usize) {
        let done = self.reseal_calls.load(Ordering::SeqCst);
        self.fail_on_call.store(done + n, Ordering::SeqCst);
    }

    pub fn reseal_calls(&self) -> usize {
        self.reseal_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for FlakyMessages {
    async fn create_thread(&self, thread: &ThreadRecord) -> StorageResult<()> {
        self.inner.create_thread(thread).await
    }

    async fn get_thread(&self, id: &ThreadId) -> StorageResult<Option<ThreadRecord>> {
        self.inner.get_thread(id).await
    }

    async fn insert_message(&self, message: &NewMessage) -> StorageResult<()> {
        self.inner.insert_message(message).await
    }

    async fn get_message(&self, id: &MessageId) -> StorageResult<Option<StoredMessage>> {
        self.inner.get_message(id).await
    }

    async fn list_messages(
        &self,
        thread: &ThreadId,
        limit: Option<u32>,
    ) -> StorageResult<Vec<StoredMessage>> {
        self.inner.list_messages(thread, limit).await
    }

    async fn sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<StoredMessage>> {
        self.inner.sealed_messages_before(user, version, limit).await
    }

    async fn count_sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64> {
        self.inner.count_sealed_messages_before(user, version).await
    }

    async fn legacy_messages(&self, user: &UserId, limit: u32) -> StorageResult<Vec<StoredMessage>> {
        self.inner.legacy_messages(user, limit).await
    }

    async fn count_legacy_messages(&self, user: &UserId) -> StorageResult<u64> {
        self.inner.count_legacy_messages(user).await
    }

    async fn reseal_messages(&self, batch: &[MessageReseal]) -> StorageResult<u64> {
        let call = self.reseal_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        self.inner.reseal_messages(batch).await
    }
}

/// Attachment store that can fail the Nth `reseal_attachments` call.
pub struct FlakyAttachments {
    inner: Arc<SqliteStorage>,
    reseal_calls: AtomicUsize,
    fail_on_call: AtomicUsize,
}

impl FlakyAttachments {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            reseal_calls: AtomicUsize::new(0),
            fail_on_call: AtomicUsize::new(0),
        }
    }

    /// Fail the `n`th reseal call from now (1-based).
    pub fn fail_reseal_call(&self, n: usize) {
        let done = self.reseal_calls.load(Ordering::SeqCst);
        self.fail_on_call.store(done + n, Ordering::SeqCst);
    }
}

#[async_trait]
impl AttachmentStore for FlakyAttachments {
    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> StorageResult<()> {
        self.inner.insert_attachment(attachment).await
    }

    async fn get_attachment(&self, id: &AttachmentId) -> StorageResult<Option<AttachmentRecord>> {
        self.inner.get_attachment(id).await
    }

    async fn list_attachments(&self, thread: &ThreadId) -> StorageResult<Vec<AttachmentRecord>> {
        self.inner.list_attachments(thread).await
    }

    async fn sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<AttachmentRecord>> {
        self.inner.sealed_attachments_before(user, version, limit).await
    }

    async fn count_sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64> {
        self.inner.count_sealed_attachments_before(user, version).await
    }

    async fn reseal_attachments(&self, batch: &[AttachmentReseal]) -> StorageResult<u64> {
        let call = self.reseal_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on_call.load(Ordering::SeqCst) {
            return Err(injected_failure());
        }
        self.inner.reseal_attachments(batch).await
    }

    async fn delete_attachment(&self, id: &AttachmentId) -> StorageResult<bool> {
        self.inner.delete_attachment(id).await
    }
}

fn injected_failure() -> StorageError {
    StorageError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        "injected batch failure",
    ))
}

/// Key metadata store that counts every call.
pub struct CountingKeyMeta {
    inner: Arc<SqliteStorage>,
    calls: AtomicUsize,
}

impl CountingKeyMeta {
    pub fn new(inner: Arc<SqliteStorage>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyMetaStore for CountingKeyMeta {
    async fn insert_key_meta_if_absent(&self, user: &UserId, salt: &Salt) -> StorageResult<bool> {
        self.count();
        self.inner.insert_key_meta_if_absent(user, salt).await
    }

    async fn get_key_meta(&self, user: &UserId) -> StorageResult<Option<KeyMeta>> {
        self.count();
        self.inner.get_key_meta(user).await
    }

    async fn get_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<Option<Salt>> {
        self.count();
        self.inner.get_history_salt(user, version).await
    }

    async fn reserve_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
        candidate: &Salt,
    ) -> StorageResult<Salt> {
        self.count();
        self.inner.reserve_history_salt(user, version, candidate).await
    }

    async fn flip_key_meta(
        &self,
        user: &UserId,
        expected: KeyVersion,
        new_version: KeyVersion,
        salt: &Salt,
        rotated_at: i64,
    ) -> StorageResult<bool> {
        self.count();
        self.inner
            .flip_key_meta(user, expected, new_version, salt, rotated_at)
            .await
    }
}

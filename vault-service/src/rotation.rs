//! Key rotation engine.
//!
//! Re-encrypts every sealed row a user owns under a fresh salt, then flips
//! the user's key metadata to the new version.
//!
//! ```text
//! reserve salt(v+1) in history ─┐
//!                               ▼
//!   for provider in [messages, attachments]:
//!       loop: fetch ≤100 rows below v+1 ─► open(old key) ─► seal(new key)
//!             ─► commit batch (one transaction)
//!                               │
//!   nothing left below v+1? ────┤ no ─► walk providers again (3 passes max),
//!                               │       then RotationIncomplete (no flip)
//!                               ▼ yes
//!   CAS key_meta: v ─► v+1 (the single point of no return)
//! ```
//!
//! The reserved salt makes rotation resumable: a retry re-reads the same
//! salt for v+1, so rows an interrupted attempt already migrated open
//! under the same key and are skipped by the `below v+1` filter.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use vault_crypto::{open, seal, DerivedKey};
use vault_store::{
    AttachmentProtection, AttachmentReseal, AttachmentStore, EnvelopeHeader, MessageReseal,
    MessageStore, ObjectStore, SealedRecord, Stored,
};
use vault_types::{KeyVersion, UserId};

use crate::attachments::object_key_for;
use crate::error::{Result, VaultError};
use crate::keys::KeyRing;

/// Rows re-encrypted per storage transaction.
pub const BATCH_SIZE: u32 = 100;

/// Walks over all providers before giving up on rows that keep arriving
/// below the target version.
const MAX_PASSES: u32 = 3;

/// Result of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows fetched below the target version. Zero means the provider is done.
    pub fetched: usize,
    /// Rows actually overwritten.
    pub migrated: u64,
}

/// A population of ciphertext sealed under per-user keys.
#[async_trait]
pub trait RotatableContent: Send + Sync {
    /// Short name used in logs and status output.
    fn name(&self) -> &'static str;

    /// Rows of `user` still sealed below `target`.
    async fn pending(&self, user: &UserId, target: KeyVersion) -> Result<u64>;

    /// Migrate up to [`BATCH_SIZE`] rows below `target` to `new_key`,
    /// committing them in one transaction.
    async fn rotate_batch(
        &self,
        keys: &KeyRing,
        user: &UserId,
        target: KeyVersion,
        new_key: &DerivedKey,
    ) -> Result<BatchOutcome>;
}

/// Summary of a completed rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    /// The user.
    pub user: UserId,
    /// Version before rotation.
    pub from: KeyVersion,
    /// Version after rotation.
    pub to: KeyVersion,
    /// Rows migrated by this call, per provider.
    pub migrated: Vec<(&'static str, u64)>,
    /// Batches committed by this call.
    pub batches: u64,
}

impl RotationReport {
    /// Total rows migrated across providers.
    pub fn total_migrated(&self) -> u64 {
        self.migrated.iter().map(|(_, n)| n).sum()
    }
}

/// Orchestrates rotation across content providers.
pub struct RotationEngine {
    keys: Arc<KeyRing>,
    providers: Vec<Arc<dyn RotatableContent>>,
    in_flight: DashMap<UserId, ()>,
}

impl std::fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("RotationEngine")
            .field("providers", &names)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl RotationEngine {
    /// Create an engine over the given providers, visited in order.
    pub fn new(keys: Arc<KeyRing>, providers: Vec<Arc<dyn RotatableContent>>) -> Self {
        Self {
            keys,
            providers,
            in_flight: DashMap::new(),
        }
    }

    /// Rotate `user` to a new key version.
    ///
    /// # Errors
    ///
    /// - `KeyNotProvisioned` if the user has never had a key
    /// - `RotationInProgress` if a rotation for the user is already running
    /// - `RotationIncomplete` if any batch failed or rows remain below the
    ///   new version; the key metadata is left unchanged and a retry resumes
    pub async fn rotate(&self, user: &UserId) -> Result<RotationReport> {
        let _guard = InFlight::acquire(&self.in_flight, user)?;

        let meta = self
            .keys
            .get(user)
            .await?
            .ok_or_else(|| VaultError::KeyNotProvisioned { user: user.clone() })?;
        let from = meta.version;
        let to = from.next().map_err(|e| incomplete(user, 0, e.to_string()))?;

        let salt = self.keys.reserve(user, to).await?;
        let new_key = self.keys.derive(user, to, &salt)?;

        tracing::info!("Starting key rotation for user {}: {} -> {}", user, from, to);

        let mut migrated: Vec<(&'static str, u64)> =
            self.providers.iter().map(|p| (p.name(), 0)).collect();
        let mut total = 0u64;
        let mut batches = 0u64;
        let mut pass = 1;

        loop {
            for (provider, (_, provider_total)) in self.providers.iter().zip(migrated.iter_mut()) {
                loop {
                    let outcome = provider
                        .rotate_batch(&self.keys, user, to, &new_key)
                        .await
                        .map_err(|e| {
                            tracing::warn!(
                                "Rotation for user {} interrupted in {} after {} rows: {}",
                                user,
                                provider.name(),
                                total,
                                e.kind()
                            );
                            incomplete(user, total, format!("{}: {}", provider.name(), e))
                        })?;

                    if outcome.fetched == 0 {
                        break;
                    }
                    if outcome.migrated == 0 {
                        // Rows exist below the target but none could be updated
                        return Err(incomplete(
                            user,
                            total,
                            format!("{}: batch made no progress", provider.name()),
                        ));
                    }

                    *provider_total += outcome.migrated;
                    total += outcome.migrated;
                    batches += 1;
                    tracing::debug!(
                        "Rotated batch {} for user {}: {} {} rows",
                        batches,
                        user,
                        outcome.migrated,
                        provider.name()
                    );
                }
            }

            // Rows written under the old version while later providers ran
            let mut behind = Vec::new();
            for provider in &self.providers {
                let remaining = provider.pending(user, to).await?;
                if remaining > 0 {
                    behind.push(format!("{} {}", remaining, provider.name()));
                }
            }
            if behind.is_empty() {
                break;
            }
            if pass >= MAX_PASSES {
                return Err(incomplete(
                    user,
                    total,
                    format!("{} rows still below {} after {} passes", behind.join(", "), to, pass),
                ));
            }
            pass += 1;
            tracing::debug!(
                "Rows written during rotation for user {}, starting pass {}",
                user,
                pass
            );
        }

        if !self.keys.flip(user, from, to, &salt).await? {
            return Err(incomplete(
                user,
                total,
                format!("key metadata moved off {} during rotation", from),
            ));
        }

        tracing::info!(
            "Completed key rotation for user {}: {} -> {} ({} rows, {} batches)",
            user,
            from,
            to,
            total,
            batches
        );

        Ok(RotationReport {
            user: user.clone(),
            from,
            to,
            migrated,
            batches,
        })
    }

    /// Rows still below `version`, per provider.
    pub async fn pending(&self, user: &UserId, version: KeyVersion) -> Result<Vec<(&'static str, u64)>> {
        let mut counts = Vec::with_capacity(self.providers.len());
        for provider in &self.providers {
            counts.push((provider.name(), provider.pending(user, version).await?));
        }
        Ok(counts)
    }

    /// Whether a rotation for `user` is running in this process.
    pub fn is_rotating(&self, user: &UserId) -> bool {
        self.in_flight.contains_key(user)
    }
}

fn incomplete(user: &UserId, migrated: u64, reason: String) -> VaultError {
    VaultError::RotationIncomplete {
        user: user.clone(),
        migrated,
        reason,
    }
}

/// Single-flight guard. Released on drop, including when the rotation
/// future is cancelled.
struct InFlight<'a> {
    map: &'a DashMap<UserId, ()>,
    user: UserId,
}

impl<'a> InFlight<'a> {
    fn acquire(map: &'a DashMap<UserId, ()>, user: &UserId) -> Result<Self> {
        match map.entry(user.clone()) {
            Entry::Occupied(_) => Err(VaultError::RotationInProgress { user: user.clone() }),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Self {
                    map,
                    user: user.clone(),
                })
            }
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.user);
    }
}

/// Message bodies.
pub struct MessageContent {
    store: Arc<dyn MessageStore>,
}

impl MessageContent {
    /// Create a provider over a message store.
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RotatableContent for MessageContent {
    fn name(&self) -> &'static str {
        "messages"
    }

    async fn pending(&self, user: &UserId, target: KeyVersion) -> Result<u64> {
        Ok(self.store.count_sealed_messages_before(user, target).await?)
    }

    async fn rotate_batch(
        &self,
        keys: &KeyRing,
        user: &UserId,
        target: KeyVersion,
        new_key: &DerivedKey,
    ) -> Result<BatchOutcome> {
        let rows = self
            .store
            .sealed_messages_before(user, target, BATCH_SIZE)
            .await?;
        if rows.is_empty() {
            return Ok(BatchOutcome {
                fetched: 0,
                migrated: 0,
            });
        }

        let mut batch = Vec::with_capacity(rows.len());
        for row in &rows {
            let Stored::Sealed(record) = &row.body else {
                continue;
            };
            let old_key = keys.key_for_version(user, record.key_version).await?;
            let plaintext = open(&record.envelope, &old_key)?;
            batch.push(MessageReseal {
                id: row.id,
                previous_version: Some(record.key_version),
                sealed: SealedRecord {
                    envelope: seal(&plaintext, new_key)?,
                    key_version: target,
                },
            });
        }

        let migrated = self.store.reseal_messages(&batch).await?;
        Ok(BatchOutcome {
            fetched: rows.len(),
            migrated,
        })
    }
}

/// Attachment bytes in the object store.
///
/// New ciphertext goes under a new object key; the row swap commits in one
/// transaction; old objects are deleted afterwards, best-effort. A crash at
/// any point leaves every row pointing at bytes it can open.
pub struct AttachmentContent {
    store: Arc<dyn AttachmentStore>,
    objects: Arc<dyn ObjectStore>,
}

impl AttachmentContent {
    /// Create a provider over attachment rows and their object store.
    pub fn new(store: Arc<dyn AttachmentStore>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { store, objects }
    }
}

#[async_trait]
impl RotatableContent for AttachmentContent {
    fn name(&self) -> &'static str {
        "attachments"
    }

    async fn pending(&self, user: &UserId, target: KeyVersion) -> Result<u64> {
        Ok(self.store.count_sealed_attachments_before(user, target).await?)
    }

    async fn rotate_batch(
        &self,
        keys: &KeyRing,
        user: &UserId,
        target: KeyVersion,
        new_key: &DerivedKey,
    ) -> Result<BatchOutcome> {
        let rows = self
            .store
            .sealed_attachments_before(user, target, BATCH_SIZE)
            .await?;
        if rows.is_empty() {
            return Ok(BatchOutcome {
                fetched: 0,
                migrated: 0,
            });
        }

        let mut batch = Vec::with_capacity(rows.len());
        let mut superseded = Vec::with_capacity(rows.len());
        for row in &rows {
            let AttachmentProtection::Encrypted(header) = row.protection else {
                continue;
            };
            let old_key = keys.key_for_version(user, header.key_version).await?;
            let ciphertext = self.objects.get(&row.object_key).await?;
            let plaintext = open(&header.join(ciphertext), &old_key)?;

            let (new_header, new_ciphertext) = EnvelopeHeader::split(SealedRecord {
                envelope: seal(&plaintext, new_key)?,
                key_version: target,
            });
            let new_object_key = object_key_for(&row.thread_id, &row.id, target);
            self.objects.put(&new_object_key, &new_ciphertext).await?;

            if new_object_key != row.object_key {
                superseded.push(row.object_key.clone());
            }
            batch.push(AttachmentReseal {
                id: row.id,
                previous_version: Some(header.key_version),
                object_key: new_object_key,
                header: new_header,
            });
        }

        let migrated = self.store.reseal_attachments(&batch).await?;

        // Skipped rows may still reference their old object
        if migrated != batch.len() as u64 {
            tracing::warn!(
                "Attachment batch for user {} swapped {} of {} rows; keeping old objects",
                user,
                migrated,
                batch.len()
            );
            superseded.clear();
        }

        for key in superseded {
            if let Err(e) = self.objects.delete(&key).await {
                tracing::warn!("Failed to delete superseded attachment object {}: {}", key, e);
            }
        }

        Ok(BatchOutcome {
            fetched: rows.len(),
            migrated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vault_crypto::{KdfParams, KeyDeriver, Salt};
    use vault_store::{KeyMetaStore, MemoryObjectStore, NewMessage, SqliteStorage, ThreadRecord};
    use vault_types::{MessageId, ThreadId};

    struct Fixture {
        storage: Arc<SqliteStorage>,
        keys: Arc<KeyRing>,
        engine: RotationEngine,
        thread: ThreadRecord,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let keys = Arc::new(KeyRing::new(
            storage.clone(),
            KeyDeriver::new(KdfParams::for_tests()),
            b"rotation-master",
        ));
        let objects: Arc<dyn ObjectStore> = Arc::new(MemoryObjectStore::new());
        let messages: Arc<dyn RotatableContent> = Arc::new(MessageContent::new(storage.clone()));
        let attachments: Arc<dyn RotatableContent> =
            Arc::new(AttachmentContent::new(storage.clone(), objects));
        let engine = RotationEngine::new(keys.clone(), vec![messages, attachments]);
        let thread = ThreadRecord {
            id: ThreadId::new(),
            user_id: UserId::new("alice").unwrap(),
            title: "t".to_string(),
            created_at: 0,
            last_message_at: None,
        };
        storage.create_thread(&thread).await.unwrap();
        Fixture {
            storage,
            keys,
            engine,
            thread,
        }
    }

    async fn write(f: &Fixture, text: &[u8]) -> MessageId {
        let (version, key) = f.keys.current_key(&f.thread.user_id).await.unwrap();
        let message = NewMessage {
            id: MessageId::new(),
            thread_id: f.thread.id,
            created_at: 1,
            sealed: SealedRecord {
                envelope: seal(text, &key).unwrap(),
                key_version: version,
            },
        };
        f.storage.insert_message(&message).await.unwrap();
        message.id
    }

    #[tokio::test]
    async fn rotation_of_unprovisioned_user_fails() {
        let f = fixture().await;
        let err = f
            .engine
            .rotate(&UserId::new("nobody").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, VaultError::KeyNotProvisioned { .. }));
    }

    #[tokio::test]
    async fn rotation_with_no_rows_still_flips() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        f.keys.get_or_create(alice).await.unwrap();

        let report = f.engine.rotate(alice).await.unwrap();
        assert_eq!(report.from, KeyVersion::INITIAL);
        assert_eq!(report.to, KeyVersion::new(2).unwrap());
        assert_eq!(report.total_migrated(), 0);
        assert_eq!(report.batches, 0);
    }

    #[tokio::test]
    async fn rotated_messages_open_under_new_version() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        let id = write(&f, b"before rotation").await;

        let report = f.engine.rotate(alice).await.unwrap();
        assert_eq!(report.migrated, vec![("messages", 1), ("attachments", 0)]);

        let row = f.storage.get_message(&id).await.unwrap().unwrap();
        let Stored::Sealed(record) = row.body else {
            panic!("expected sealed row");
        };
        assert_eq!(record.key_version, report.to);

        let key = f.keys.key_for_version(alice, report.to).await.unwrap();
        assert_eq!(
            open(&record.envelope, &key).unwrap().as_slice(),
            b"before rotation"
        );
    }

    #[tokio::test]
    async fn second_rotation_advances_again() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        write(&f, b"x").await;

        f.engine.rotate(alice).await.unwrap();
        let report = f.engine.rotate(alice).await.unwrap();
        assert_eq!(report.to, KeyVersion::new(3).unwrap());
        assert_eq!(report.total_migrated(), 1);
    }

    #[tokio::test]
    async fn undecryptable_row_aborts_without_flip() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        write(&f, b"good").await;

        // A row sealed under an unrelated key
        let bogus = DerivedKey::from_bytes([7; 32]);
        f.storage
            .insert_message(&NewMessage {
                id: MessageId::new(),
                thread_id: f.thread.id,
                created_at: 2,
                sealed: SealedRecord {
                    envelope: seal(b"bad", &bogus).unwrap(),
                    key_version: KeyVersion::INITIAL,
                },
            })
            .await
            .unwrap();

        let err = f.engine.rotate(alice).await.unwrap_err();
        assert_eq!(err.kind(), "rotation_incomplete");

        let meta = f.keys.get(alice).await.unwrap().unwrap();
        assert_eq!(meta.version, KeyVersion::INITIAL);
    }

    #[tokio::test]
    async fn guard_rejects_concurrent_rotation_and_releases_on_drop() {
        let f = fixture().await;
        let alice = f.thread.user_id.clone();
        f.keys.get_or_create(&alice).await.unwrap();

        {
            let _held = InFlight::acquire(&f.engine.in_flight, &alice).unwrap();
            assert!(f.engine.is_rotating(&alice));
            let err = f.engine.rotate(&alice).await.unwrap_err();
            assert!(matches!(err, VaultError::RotationInProgress { .. }));
        }

        assert!(!f.engine.is_rotating(&alice));
        f.engine.rotate(&alice).await.unwrap();
    }

    /// Writes a message under the current key each time it is visited.
    struct LateWriter {
        storage: Arc<SqliteStorage>,
        thread: ThreadRecord,
        writes_left: AtomicU32,
    }

    #[async_trait]
    impl RotatableContent for LateWriter {
        fn name(&self) -> &'static str {
            "late-writer"
        }

        async fn pending(&self, _user: &UserId, _target: KeyVersion) -> Result<u64> {
            Ok(0)
        }

        async fn rotate_batch(
            &self,
            keys: &KeyRing,
            user: &UserId,
            _target: KeyVersion,
            _new_key: &DerivedKey,
        ) -> Result<BatchOutcome> {
            let left = self.writes_left.load(Ordering::SeqCst);
            if left > 0 {
                self.writes_left.store(left - 1, Ordering::SeqCst);
                let (version, key) = keys.current_key(user).await?;
                self.storage
                    .insert_message(&NewMessage {
                        id: MessageId::new(),
                        thread_id: self.thread.id,
                        created_at: 3,
                        sealed: SealedRecord {
                            envelope: seal(b"late", &key)?,
                            key_version: version,
                        },
                    })
                    .await?;
            }
            Ok(BatchOutcome {
                fetched: 0,
                migrated: 0,
            })
        }
    }

    fn engine_with_late_writer(f: &Fixture, writes: u32) -> RotationEngine {
        let messages: Arc<dyn RotatableContent> =
            Arc::new(MessageContent::new(f.storage.clone()));
        let late: Arc<dyn RotatableContent> = Arc::new(LateWriter {
            storage: f.storage.clone(),
            thread: f.thread.clone(),
            writes_left: AtomicU32::new(writes),
        });
        RotationEngine::new(f.keys.clone(), vec![messages, late])
    }

    #[tokio::test]
    async fn rows_written_mid_rotation_are_swept_by_another_pass() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        write(&f, b"early").await;
        let engine = engine_with_late_writer(&f, 1);

        let report = engine.rotate(alice).await.unwrap();
        assert_eq!(report.migrated, vec![("messages", 2), ("late-writer", 0)]);
        assert_eq!(report.batches, 2);
        assert_eq!(
            f.storage
                .count_sealed_messages_before(alice, report.to)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn steady_writes_give_up_after_bounded_passes() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        write(&f, b"early").await;
        let engine = engine_with_late_writer(&f, MAX_PASSES + 1);

        match engine.rotate(alice).await.unwrap_err() {
            VaultError::RotationIncomplete { reason, .. } => {
                assert!(reason.contains("after 3 passes"), "{}", reason)
            }
            other => panic!("unexpected error {:?}", other),
        }

        let meta = f.keys.get(alice).await.unwrap().unwrap();
        assert_eq!(meta.version, KeyVersion::INITIAL);
    }

    #[tokio::test]
    async fn rotation_at_last_version_fails_without_flip() {
        let f = fixture().await;
        let alice = &f.thread.user_id;
        f.keys.get_or_create(alice).await.unwrap();

        let last = KeyVersion::new(u32::MAX).unwrap();
        assert!(f
            .storage
            .flip_key_meta(alice, KeyVersion::INITIAL, last, &Salt::random().unwrap(), 1)
            .await
            .unwrap());

        let err = f.engine.rotate(alice).await.unwrap_err();
        assert!(matches!(err, VaultError::RotationIncomplete { migrated: 0, .. }));

        let meta = f.keys.get(alice).await.unwrap().unwrap();
        assert_eq!(meta.version, last);
    }
}

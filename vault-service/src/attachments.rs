//! Attachment write/read.
//!
//! Sealed bytes go to the object store; the row keeps only the envelope
//! header and `is_encrypted`. Legacy uploads (`is_encrypted = 0`) are
//! returned as stored.

use std::sync::Arc;
use vault_crypto::{open, seal};
use vault_store::{
    unix_timestamp, AttachmentProtection, AttachmentRecord, AttachmentStore, EnvelopeHeader,
    MessageStore, ObjectStore, SealedRecord,
};
use vault_types::{AttachmentId, KeyVersion, ThreadId};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::keys::KeyRing;

/// Object key for an attachment's bytes sealed under `version`.
///
/// Versioned so rotation can write new ciphertext next to the old object.
pub(crate) fn object_key_for(thread: &ThreadId, id: &AttachmentId, version: KeyVersion) -> String {
    format!("{}/{}.v{}", thread, id, version.value())
}

/// Attachment metadata supplied by the upload path.
#[derive(Debug, Clone)]
pub struct NewAttachment<'a> {
    /// Thread the file belongs to; its owner's key seals the bytes.
    pub thread_id: ThreadId,
    /// Original file name.
    pub file_name: &'a str,
    /// MIME type.
    pub content_type: &'a str,
}

/// Seals and opens attachment bytes.
pub struct AttachmentVault {
    keys: Arc<KeyRing>,
    threads: Arc<dyn MessageStore>,
    store: Arc<dyn AttachmentStore>,
    objects: Arc<dyn ObjectStore>,
}

impl AttachmentVault {
    /// Create the attachment facade.
    pub fn new(
        keys: Arc<KeyRing>,
        threads: Arc<dyn MessageStore>,
        store: Arc<dyn AttachmentStore>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            keys,
            threads,
            store,
            objects,
        }
    }

    /// Seal `bytes` under the thread owner's current key and store them.
    pub async fn write_attachment(
        &self,
        upload: NewAttachment<'_>,
        bytes: &[u8],
    ) -> Result<AttachmentRecord> {
        let thread = self
            .threads
            .get_thread(&upload.thread_id)
            .await?
            .ok_or_else(|| VaultError::not_found("thread", upload.thread_id))?;

        let (version, key) = self.keys.current_key(&thread.user_id).await?;
        let (header, ciphertext) = EnvelopeHeader::split(SealedRecord {
            envelope: seal(bytes, &key)?,
            key_version: version,
        });

        let id = AttachmentId::new();
        let object_key = object_key_for(&thread.id, &id, version);
        self.objects.put(&object_key, &ciphertext).await?;

        let record = AttachmentRecord {
            id,
            thread_id: thread.id,
            user_id: thread.user_id,
            object_key,
            file_name: upload.file_name.to_string(),
            content_type: upload.content_type.to_string(),
            size: bytes.len() as u64,
            created_at: unix_timestamp(),
            protection: AttachmentProtection::Encrypted(header),
        };

        if let Err(e) = self.store.insert_attachment(&record).await {
            if let Err(cleanup) = self.objects.delete(&record.object_key).await {
                tracing::warn!(
                    "Failed to remove orphaned attachment object {}: {}",
                    record.object_key,
                    cleanup
                );
            }
            return Err(e.into());
        }

        Ok(record)
    }

    /// Attachment bytes, decrypted if the row is sealed.
    pub async fn read_attachment(&self, id: &AttachmentId) -> Result<Zeroizing<Vec<u8>>> {
        let record = self
            .store
            .get_attachment(id)
            .await?
            .ok_or_else(|| VaultError::not_found("attachment", id))?;
        let stored = self.objects.get(&record.object_key).await?;

        match record.protection {
            AttachmentProtection::Plaintext => Ok(Zeroizing::new(stored)),
            AttachmentProtection::Encrypted(header) => {
                let key = self
                    .keys
                    .key_for_version(&record.user_id, header.key_version)
                    .await?;
                open(&header.join(stored), &key).map_err(|e| {
                    tracing::warn!("Attachment {} unavailable: {}", id, e);
                    VaultError::from(e)
                })
            }
        }
    }

    /// Attachment metadata for a thread.
    pub async fn list_attachments(&self, thread: &ThreadId) -> Result<Vec<AttachmentRecord>> {
        Ok(self.store.list_attachments(thread).await?)
    }

    /// Delete the row, then its object. Returns whether the row existed.
    pub async fn delete_attachment(&self, id: &AttachmentId) -> Result<bool> {
        let Some(record) = self.store.get_attachment(id).await? else {
            return Ok(false);
        };
        if !self.store.delete_attachment(id).await? {
            return Ok(false);
        }
        if let Err(e) = self.objects.delete(&record.object_key).await {
            tracing::warn!("Failed to delete attachment object {}: {}", record.object_key, e);
        }
        Ok(true)
    }
}

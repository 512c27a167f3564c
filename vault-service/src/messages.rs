//! Message persistence and retrieval.
//!
//! Writes always seal under the thread owner's current key. Reads branch on
//! the row: sealed rows open under the key for their own recorded version,
//! legacy plaintext rows are returned as stored without touching the key
//! ring.
//!
//! Bulk reads (`list_messages`, `share_preview`) never fail as a whole on a
//! single undecryptable row; that row comes back as [`Readable::Unavailable`]
//! and the cause is logged. A malformed envelope still fails the whole read.

use std::sync::Arc;
use vault_crypto::{open, seal};
use vault_store::{
    unix_timestamp, MessageReseal, MessageStore, NewMessage, SealedRecord, Stored, StoredMessage,
    ThreadRecord,
};
use vault_types::{MessageBody, MessageId, MessageRole, ThreadId, UserId};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};
use crate::keys::KeyRing;
use crate::rotation::BATCH_SIZE;

/// Characters of message content kept per share preview line.
pub const PREVIEW_SNIPPET_CHARS: usize = 200;

/// A value from a bulk read that may not have been decryptable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readable<T> {
    /// Decrypted (or legacy) content.
    Available(T),
    /// Content could not be decrypted; shown to users as "unable to decrypt".
    Unavailable {
        /// Error kind, for operators.
        kind: &'static str,
    },
}

impl<T> Readable<T> {
    /// The content, if available.
    pub fn available(&self) -> Option<&T> {
        match self {
            Readable::Available(value) => Some(value),
            Readable::Unavailable { .. } => None,
        }
    }

    fn map<U>(self, f: impl FnOnce(T) -> U) -> Readable<U> {
        match self {
            Readable::Available(value) => Readable::Available(f(value)),
            Readable::Unavailable { kind } => Readable::Unavailable { kind },
        }
    }
}

/// A decrypted message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id.
    pub id: MessageId,
    /// Parent thread.
    pub thread_id: ThreadId,
    /// Creation time.
    pub created_at: i64,
    /// Message body.
    pub body: MessageBody,
}

/// One row of a bulk read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEntry {
    /// Message id.
    pub id: MessageId,
    /// Creation time.
    pub created_at: i64,
    /// Message body, or a placeholder.
    pub body: Readable<MessageBody>,
}

/// One line of a share preview.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewLine {
    /// Author role, when the body was readable.
    pub role: Option<MessageRole>,
    /// Truncated content.
    pub snippet: Readable<String>,
}

/// Title and opening lines of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePreview {
    /// Thread id.
    pub thread_id: ThreadId,
    /// Thread title.
    pub title: String,
    /// First messages, oldest first.
    pub lines: Vec<PreviewLine>,
}

/// Seals and opens message bodies.
pub struct MessageVault {
    keys: Arc<KeyRing>,
    store: Arc<dyn MessageStore>,
}

impl MessageVault {
    /// Create the message facade.
    pub fn new(keys: Arc<KeyRing>, store: Arc<dyn MessageStore>) -> Self {
        Self { keys, store }
    }

    /// Create a thread owned by `user`.
    pub async fn create_thread(&self, user: &UserId, title: &str) -> Result<ThreadRecord> {
        let thread = ThreadRecord {
            id: ThreadId::new(),
            user_id: user.clone(),
            title: title.to_string(),
            created_at: unix_timestamp(),
            last_message_at: None,
        };
        self.store.create_thread(&thread).await?;
        Ok(thread)
    }

    /// Seal and persist a message.
    ///
    /// The insert and the thread's `last_message_at` update commit together.
    pub async fn write_message(&self, thread_id: &ThreadId, body: &MessageBody) -> Result<MessageId> {
        let thread = self.thread(thread_id).await?;
        let (version, key) = self.keys.current_key(&thread.user_id).await?;

        let plaintext = Zeroizing::new(serde_json::to_vec(body)?);
        let message = NewMessage {
            id: MessageId::new(),
            thread_id: thread.id,
            created_at: unix_timestamp(),
            sealed: SealedRecord {
                envelope: seal(&plaintext, &key)?,
                key_version: version,
            },
        };

        self.store.insert_message(&message).await?;
        Ok(message.id)
    }

    /// Read one message. Any failure, including decryption, is returned.
    pub async fn read_message(&self, id: &MessageId) -> Result<Message> {
        let row = self
            .store
            .get_message(id)
            .await?
            .ok_or_else(|| VaultError::not_found("message", id))?;
        let thread = self.thread(&row.thread_id).await?;
        let body = self.decode(&thread.user_id, &row.body).await?;

        Ok(Message {
            id: row.id,
            thread_id: row.thread_id,
            created_at: row.created_at,
            body,
        })
    }

    /// Messages of a thread in order, with per-row placeholders.
    pub async fn list_messages(
        &self,
        thread_id: &ThreadId,
        limit: Option<u32>,
    ) -> Result<Vec<MessageEntry>> {
        let thread = self.thread(thread_id).await?;
        self.read_rows(&thread, limit).await
    }

    /// Title and first `limit` messages of a thread, content truncated.
    pub async fn share_preview(&self, thread_id: &ThreadId, limit: u32) -> Result<SharePreview> {
        let thread = self.thread(thread_id).await?;
        let entries = self.read_rows(&thread, Some(limit)).await?;

        let lines = entries
            .into_iter()
            .map(|entry| PreviewLine {
                role: entry.body.available().map(|body| body.role),
                snippet: entry.body.map(|body| snippet(&body.content)),
            })
            .collect();

        Ok(SharePreview {
            thread_id: thread.id,
            title: thread.title,
            lines,
        })
    }

    /// Seal every legacy plaintext message of `user` under the current key.
    ///
    /// Batched like rotation; each batch clears the plaintext column in the
    /// same transaction that writes the envelope. Returns rows migrated.
    pub async fn encrypt_legacy(&self, user: &UserId) -> Result<u64> {
        let mut migrated = 0u64;

        loop {
            let rows = self.store.legacy_messages(user, BATCH_SIZE).await?;
            if rows.is_empty() {
                break;
            }

            let (version, key) = self.keys.current_key(user).await?;
            let mut batch = Vec::with_capacity(rows.len());
            for row in &rows {
                let Stored::Plaintext(legacy) = &row.body else {
                    continue;
                };
                batch.push(MessageReseal {
                    id: row.id,
                    previous_version: None,
                    sealed: SealedRecord {
                        envelope: seal(legacy.as_bytes(), &key)?,
                        key_version: version,
                    },
                });
            }

            let updated = self.store.reseal_messages(&batch).await?;
            if updated == 0 {
                return Err(VaultError::Storage(vault_store::StorageError::Migration(
                    "legacy batch made no progress".to_string(),
                )));
            }
            migrated += updated;
            tracing::debug!("Encrypted {} legacy messages for user {}", updated, user);
        }

        if migrated > 0 {
            tracing::info!("Encrypted {} legacy messages for user {}", migrated, user);
        }
        Ok(migrated)
    }

    async fn thread(&self, id: &ThreadId) -> Result<ThreadRecord> {
        self.store
            .get_thread(id)
            .await?
            .ok_or_else(|| VaultError::not_found("thread", id))
    }

    async fn read_rows(&self, thread: &ThreadRecord, limit: Option<u32>) -> Result<Vec<MessageEntry>> {
        let rows = self.store.list_messages(&thread.id, limit).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let body = self.readable(&thread.user_id, &row).await?;
            entries.push(MessageEntry {
                id: row.id,
                created_at: row.created_at,
                body,
            });
        }
        Ok(entries)
    }

    async fn readable(&self, owner: &UserId, row: &StoredMessage) -> Result<Readable<MessageBody>> {
        match self.decode(owner, &row.body).await {
            Ok(body) => Ok(Readable::Available(body)),
            Err(e) if e.is_row_unavailable() => {
                tracing::warn!("Message {} unavailable: {}", row.id, e.kind());
                Ok(Readable::Unavailable { kind: e.kind() })
            }
            Err(e) => Err(e),
        }
    }

    async fn decode(&self, owner: &UserId, body: &Stored<String>) -> Result<MessageBody> {
        match body {
            Stored::Plaintext(legacy) => Ok(serde_json::from_str(legacy)?),
            Stored::Sealed(record) => {
                let key = self.keys.key_for_version(owner, record.key_version).await?;
                let plaintext = open(&record.envelope, &key)?;
                Ok(serde_json::from_slice(&plaintext)?)
            }
        }
    }
}

fn snippet(content: &str) -> String {
    match content.char_indices().nth(PREVIEW_SNIPPET_CHARS) {
        Some((cut, _)) => format!("{}…", &content[..cut]),
        None => content.to_string(),
    }
}

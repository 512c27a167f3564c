//! SQLite storage backend for chatvault.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use vault_crypto::Salt;
use vault_types::{AttachmentId, KeyVersion, MessageId, ThreadId, UserId};

use crate::error::{StorageError, StorageResult};
use crate::model::{
    unix_timestamp, AttachmentProtection, AttachmentRecord, AttachmentReseal, EnvelopeHeader,
    KeyMeta, MessageReseal, NewMessage, Stored, StoredMessage, ThreadRecord,
};
use crate::{AttachmentStore, KeyMetaStore, MessageStore, SettingsStore};

/// Settings blob key holding the provider → encoded credential map.
const API_KEYS_FIELD: &str = "apiKeys";

const MESSAGE_COLUMNS: &str =
    "m.id, m.thread_id, m.created_at, m.body, m.iv, m.ciphertext, m.auth_tag, m.key_version";

const ATTACHMENT_COLUMNS: &str = "id, thread_id, user_id, object_key, file_name, content_type, \
     size, created_at, is_encrypted, iv, auth_tag, key_version";

/// SQLite-based row storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) the database at `path` and run migrations.
    pub async fn new(path: &Path) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        tracing::info!("Opened SQLite storage at {}", path.display());
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    ///
    /// Single connection that never expires, since every `:memory:`
    /// connection is its own database.
    pub async fn in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(":memory:")?
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> StorageResult<()> {
        tracing::debug!("Running storage migrations");
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS key_meta (
                user_id TEXT PRIMARY KEY,
                salt BLOB NOT NULL,
                version INTEGER NOT NULL CHECK (version >= 1),
                rotated_at INTEGER,
                created_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS key_history (
                user_id TEXT NOT NULL,
                version INTEGER NOT NULL CHECK (version >= 1),
                salt BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_message_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                created_at INTEGER NOT NULL,
                body TEXT,
                iv BLOB,
                ciphertext BLOB,
                auth_tag BLOB,
                key_version INTEGER,
                CHECK (
                    (body IS NULL AND iv IS NOT NULL AND ciphertext IS NOT NULL
                        AND auth_tag IS NOT NULL AND key_version IS NOT NULL)
                    OR
                    (body IS NOT NULL AND iv IS NULL AND ciphertext IS NULL
                        AND auth_tag IS NULL AND key_version IS NULL)
                )
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id),
                user_id TEXT NOT NULL,
                object_key TEXT NOT NULL,
                file_name TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                is_encrypted INTEGER NOT NULL,
                iv BLOB,
                auth_tag BLOB,
                key_version INTEGER,
                CHECK (
                    (is_encrypted = 1 AND iv IS NOT NULL AND auth_tag IS NOT NULL
                        AND key_version IS NOT NULL)
                    OR
                    (is_encrypted = 0 AND iv IS NULL AND auth_tag IS NULL
                        AND key_version IS NULL)
                )
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                settings TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_threads_user ON threads(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_messages_version ON messages(key_version)",
            "CREATE INDEX IF NOT EXISTS idx_attachments_user ON attachments(user_id, key_version)",
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }

    /// Insert a plaintext message row as written before encryption existed.
    ///
    /// Only used when importing old data; the write path never calls this.
    pub async fn insert_legacy_message(
        &self,
        id: &MessageId,
        thread_id: &ThreadId,
        created_at: i64,
        body_json: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, created_at, body)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(id.to_string())
        .bind(thread_id.to_string())
        .bind(created_at)
        .bind(body_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyMetaStore for SqliteStorage {
    async fn insert_key_meta_if_absent(&self, user: &UserId, salt: &Salt) -> StorageResult<bool> {
        let now = unix_timestamp();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO key_meta (user_id, salt, version, rotated_at, created_at)
            VALUES (?1, ?2, ?3, NULL, ?4)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .bind(salt.as_bytes().as_slice())
        .bind(KeyVersion::INITIAL.as_i64())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if inserted {
            sqlx::query(
                r#"
                INSERT INTO key_history (user_id, version, salt, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(user_id, version) DO NOTHING
                "#,
            )
            .bind(user.as_str())
            .bind(KeyVersion::INITIAL.as_i64())
            .bind(salt.as_bytes().as_slice())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_key_meta(&self, user: &UserId) -> StorageResult<Option<KeyMeta>> {
        let row = sqlx::query_as::<_, KeyMetaRow>(
            r#"
            SELECT user_id, salt, version, rotated_at
            FROM key_meta
            WHERE user_id = ?1
            "#,
        )
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(KeyMeta::try_from).transpose()
    }

    async fn get_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<Option<Salt>> {
        let salt: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            SELECT salt FROM key_history WHERE user_id = ?1 AND version = ?2
            "#,
        )
        .bind(user.as_str())
        .bind(version.as_i64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(salt.map(|s| Salt::from_slice(&s)).transpose()?)
    }

    async fn reserve_history_salt(
        &self,
        user: &UserId,
        version: KeyVersion,
        candidate: &Salt,
    ) -> StorageResult<Salt> {
        sqlx::query(
            r#"
            INSERT INTO key_history (user_id, version, salt, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id, version) DO NOTHING
            "#,
        )
        .bind(user.as_str())
        .bind(version.as_i64())
        .bind(candidate.as_bytes().as_slice())
        .bind(unix_timestamp())
        .execute(&self.pool)
        .await?;

        self.get_history_salt(user, version)
            .await?
            .ok_or_else(|| StorageError::NotFound {
                kind: "key history",
                id: format!("{}@{}", user, version),
            })
    }

    async fn flip_key_meta(
        &self,
        user: &UserId,
        expected: KeyVersion,
        new_version: KeyVersion,
        salt: &Salt,
        rotated_at: i64,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        let flipped = sqlx::query(
            r#"
            UPDATE key_meta
            SET salt = ?1, version = ?2, rotated_at = ?3
            WHERE user_id = ?4 AND version = ?5
            "#,
        )
        .bind(salt.as_bytes().as_slice())
        .bind(new_version.as_i64())
        .bind(rotated_at)
        .bind(user.as_str())
        .bind(expected.as_i64())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if flipped {
            sqlx::query(
                r#"
                INSERT INTO key_history (user_id, version, salt, created_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(user_id, version) DO NOTHING
                "#,
            )
            .bind(user.as_str())
            .bind(new_version.as_i64())
            .bind(salt.as_bytes().as_slice())
            .bind(rotated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(flipped)
    }
}

#[async_trait]
impl MessageStore for SqliteStorage {
    async fn create_thread(&self, thread: &ThreadRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (id, user_id, title, created_at, last_message_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(thread.id.to_string())
        .bind(thread.user_id.as_str())
        .bind(&thread.title)
        .bind(thread.created_at)
        .bind(thread.last_message_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_thread(&self, id: &ThreadId) -> StorageResult<Option<ThreadRecord>> {
        let row = sqlx::query_as::<_, ThreadRow>(
            r#"
            SELECT id, user_id, title, created_at, last_message_at
            FROM threads
            WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ThreadRecord::try_from).transpose()
    }

    async fn insert_message(&self, message: &NewMessage) -> StorageResult<()> {
        let envelope = &message.sealed.envelope;
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            r#"
            UPDATE threads
            SET last_message_at = MAX(COALESCE(last_message_at, 0), ?1)
            WHERE id = ?2
            "#,
        )
        .bind(message.created_at)
        .bind(message.thread_id.to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if touched == 0 {
            // Dropping the transaction rolls it back
            return Err(StorageError::NotFound {
                kind: "thread",
                id: message.thread_id.to_string(),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO messages (id, thread_id, created_at, iv, ciphertext, auth_tag, key_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.thread_id.to_string())
        .bind(message.created_at)
        .bind(envelope.iv.as_slice())
        .bind(envelope.ciphertext.as_slice())
        .bind(envelope.auth_tag.as_slice())
        .bind(message.sealed.key_version.as_i64())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, id: &MessageId) -> StorageResult<Option<StoredMessage>> {
        let sql = format!("SELECT {} FROM messages m WHERE m.id = ?1", MESSAGE_COLUMNS);
        let row = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(StoredMessage::try_from).transpose()
    }

    async fn list_messages(
        &self,
        thread: &ThreadId,
        limit: Option<u32>,
    ) -> StorageResult<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages m WHERE m.thread_id = ?1 \
             ORDER BY m.created_at ASC, m.rowid ASC LIMIT ?2",
            MESSAGE_COLUMNS
        );
        // SQLite treats a negative LIMIT as unbounded
        let limit = limit.map(i64::from).unwrap_or(-1);
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(thread.to_string())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages m JOIN threads t ON t.id = m.thread_id \
             WHERE t.user_id = ?1 AND m.iv IS NOT NULL AND m.key_version < ?2 \
             ORDER BY m.rowid ASC LIMIT ?3",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(user.as_str())
            .bind(version.as_i64())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn count_sealed_messages_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m JOIN threads t ON t.id = m.thread_id
            WHERE t.user_id = ?1 AND m.iv IS NOT NULL AND m.key_version < ?2
            "#,
        )
        .bind(user.as_str())
        .bind(version.as_i64())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn legacy_messages(&self, user: &UserId, limit: u32) -> StorageResult<Vec<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages m JOIN threads t ON t.id = m.thread_id \
             WHERE t.user_id = ?1 AND m.iv IS NULL \
             ORDER BY m.rowid ASC LIMIT ?2",
            MESSAGE_COLUMNS
        );
        let rows = sqlx::query_as::<_, MessageRow>(&sql)
            .bind(user.as_str())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    async fn count_legacy_messages(&self, user: &UserId) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM messages m JOIN threads t ON t.id = m.thread_id
            WHERE t.user_id = ?1 AND m.iv IS NULL
            "#,
        )
        .bind(user.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn reseal_messages(&self, batch: &[MessageReseal]) -> StorageResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for reseal in batch {
            let envelope = &reseal.sealed.envelope;
            let query = match reseal.previous_version {
                Some(previous) => sqlx::query(
                    r#"
                    UPDATE messages
                    SET iv = ?1, ciphertext = ?2, auth_tag = ?3, key_version = ?4, body = NULL
                    WHERE id = ?5 AND key_version = ?6
                    "#,
                )
                .bind(envelope.iv.as_slice())
                .bind(envelope.ciphertext.as_slice())
                .bind(envelope.auth_tag.as_slice())
                .bind(reseal.sealed.key_version.as_i64())
                .bind(reseal.id.to_string())
                .bind(previous.as_i64()),
                None => sqlx::query(
                    r#"
                    UPDATE messages
                    SET iv = ?1, ciphertext = ?2, auth_tag = ?3, key_version = ?4, body = NULL
                    WHERE id = ?5 AND iv IS NULL
                    "#,
                )
                .bind(envelope.iv.as_slice())
                .bind(envelope.ciphertext.as_slice())
                .bind(envelope.auth_tag.as_slice())
                .bind(reseal.sealed.key_version.as_i64())
                .bind(reseal.id.to_string()),
            };
            updated += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }
}

#[async_trait]
impl AttachmentStore for SqliteStorage {
    async fn insert_attachment(&self, attachment: &AttachmentRecord) -> StorageResult<()> {
        let (is_encrypted, iv, auth_tag, key_version) = match &attachment.protection {
            AttachmentProtection::Encrypted(header) => (
                true,
                Some(header.iv.to_vec()),
                Some(header.auth_tag.to_vec()),
                Some(header.key_version.as_i64()),
            ),
            AttachmentProtection::Plaintext => (false, None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO attachments (id, thread_id, user_id, object_key, file_name, content_type,
                                     size, created_at, is_encrypted, iv, auth_tag, key_version)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(attachment.id.to_string())
        .bind(attachment.thread_id.to_string())
        .bind(attachment.user_id.as_str())
        .bind(&attachment.object_key)
        .bind(&attachment.file_name)
        .bind(&attachment.content_type)
        .bind(attachment.size as i64)
        .bind(attachment.created_at)
        .bind(is_encrypted)
        .bind(iv)
        .bind(auth_tag)
        .bind(key_version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_attachment(&self, id: &AttachmentId) -> StorageResult<Option<AttachmentRecord>> {
        let sql = format!("SELECT {} FROM attachments WHERE id = ?1", ATTACHMENT_COLUMNS);
        let row = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(AttachmentRecord::try_from).transpose()
    }

    async fn list_attachments(&self, thread: &ThreadId) -> StorageResult<Vec<AttachmentRecord>> {
        let sql = format!(
            "SELECT {} FROM attachments WHERE thread_id = ?1 ORDER BY created_at ASC, rowid ASC",
            ATTACHMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(thread.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AttachmentRecord::try_from).collect()
    }

    async fn sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
        limit: u32,
    ) -> StorageResult<Vec<AttachmentRecord>> {
        let sql = format!(
            "SELECT {} FROM attachments \
             WHERE user_id = ?1 AND is_encrypted = 1 AND key_version < ?2 \
             ORDER BY rowid ASC LIMIT ?3",
            ATTACHMENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, AttachmentRow>(&sql)
            .bind(user.as_str())
            .bind(version.as_i64())
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(AttachmentRecord::try_from).collect()
    }

    async fn count_sealed_attachments_before(
        &self,
        user: &UserId,
        version: KeyVersion,
    ) -> StorageResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM attachments
            WHERE user_id = ?1 AND is_encrypted = 1 AND key_version < ?2
            "#,
        )
        .bind(user.as_str())
        .bind(version.as_i64())
        .fetch_one(&self.pool)
        .await?;

        Ok(count as u64)
    }

    async fn reseal_attachments(&self, batch: &[AttachmentReseal]) -> StorageResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut updated = 0;

        for reseal in batch {
            let header = &reseal.header;
            let query = match reseal.previous_version {
                Some(previous) => sqlx::query(
                    r#"
                    UPDATE attachments
                    SET object_key = ?1, is_encrypted = 1, iv = ?2, auth_tag = ?3, key_version = ?4
                    WHERE id = ?5 AND key_version = ?6
                    "#,
                )
                .bind(&reseal.object_key)
                .bind(header.iv.as_slice())
                .bind(header.auth_tag.as_slice())
                .bind(header.key_version.as_i64())
                .bind(reseal.id.to_string())
                .bind(previous.as_i64()),
                None => sqlx::query(
                    r#"
                    UPDATE attachments
                    SET object_key = ?1, is_encrypted = 1, iv = ?2, auth_tag = ?3, key_version = ?4
                    WHERE id = ?5 AND is_encrypted = 0
                    "#,
                )
                .bind(&reseal.object_key)
                .bind(header.iv.as_slice())
                .bind(header.auth_tag.as_slice())
                .bind(header.key_version.as_i64())
                .bind(reseal.id.to_string()),
            };
            updated += query.execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_attachment(&self, id: &AttachmentId) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM attachments WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SettingsStore for SqliteStorage {
    async fn get_credential(&self, user: &UserId, provider: &str) -> StorageResult<Option<String>> {
        let settings = load_settings(&self.pool, user).await?;
        Ok(settings
            .as_ref()
            .and_then(|s| s.get(API_KEYS_FIELD))
            .and_then(|keys| keys.get(provider))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn put_credential(&self, user: &UserId, provider: &str, encoded: &str) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        let mut settings = load_settings(&mut *tx, user)
            .await?
            .unwrap_or_else(|| Value::Object(Map::new()));
        api_keys_mut(&mut settings)?.insert(provider.to_string(), Value::String(encoded.to_string()));
        store_settings(&mut *tx, user, &settings).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_credential(&self, user: &UserId, provider: &str) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(mut settings) = load_settings(&mut *tx, user).await? else {
            return Ok(false);
        };
        let removed = api_keys_mut(&mut settings)?.remove(provider).is_some();
        if removed {
            store_settings(&mut *tx, user, &settings).await?;
        }

        tx.commit().await?;
        Ok(removed)
    }

    async fn credential_providers(&self, user: &UserId) -> StorageResult<Vec<String>> {
        let settings = load_settings(&self.pool, user).await?;
        let mut providers: Vec<String> = settings
            .as_ref()
            .and_then(|s| s.get(API_KEYS_FIELD))
            .and_then(Value::as_object)
            .map(|keys| keys.keys().cloned().collect())
            .unwrap_or_default();
        providers.sort();
        Ok(providers)
    }
}

async fn load_settings<'e, E>(executor: E, user: &UserId) -> StorageResult<Option<Value>>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let raw: Option<String> =
        sqlx::query_scalar("SELECT settings FROM user_settings WHERE user_id = ?1")
            .bind(user.as_str())
            .fetch_optional(executor)
            .await?;

    Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
}

async fn store_settings<'e, E>(executor: E, user: &UserId, settings: &Value) -> StorageResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO user_settings (user_id, settings)
        VALUES (?1, ?2)
        ON CONFLICT(user_id) DO UPDATE SET settings = excluded.settings
        "#,
    )
    .bind(user.as_str())
    .bind(serde_json::to_string(settings)?)
    .execute(executor)
    .await?;
    Ok(())
}

fn api_keys_mut(settings: &mut Value) -> StorageResult<&mut Map<String, Value>> {
    settings
        .as_object_mut()
        .ok_or_else(|| StorageError::corrupt("settings blob is not an object"))?
        .entry(API_KEYS_FIELD)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StorageError::corrupt("apiKeys is not an object"))
}

/// Internal row types for SQLite queries.
#[derive(sqlx::FromRow)]
struct KeyMetaRow {
    user_id: String,
    salt: Vec<u8>,
    version: i64,
    rotated_at: Option<i64>,
}

impl TryFrom<KeyMetaRow> for KeyMeta {
    type Error = StorageError;

    fn try_from(row: KeyMetaRow) -> Result<Self, Self::Error> {
        Ok(KeyMeta {
            user_id: parse_user(row.user_id)?,
            salt: Salt::from_slice(&row.salt)?,
            version: parse_version(row.version)?,
            rotated_at: row.rotated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ThreadRow {
    id: String,
    user_id: String,
    title: String,
    created_at: i64,
    last_message_at: Option<i64>,
}

impl TryFrom<ThreadRow> for ThreadRecord {
    type Error = StorageError;

    fn try_from(row: ThreadRow) -> Result<Self, Self::Error> {
        Ok(ThreadRecord {
            id: parse_id(&row.id)?,
            user_id: parse_user(row.user_id)?,
            title: row.title,
            created_at: row.created_at,
            last_message_at: row.last_message_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    thread_id: String,
    created_at: i64,
    body: Option<String>,
    iv: Option<Vec<u8>>,
    ciphertext: Option<Vec<u8>>,
    auth_tag: Option<Vec<u8>>,
    key_version: Option<i64>,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StorageError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(StoredMessage {
            id: parse_id(&row.id)?,
            thread_id: parse_id(&row.thread_id)?,
            created_at: row.created_at,
            body: Stored::from_columns(row.iv, row.ciphertext, row.auth_tag, row.key_version, row.body)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AttachmentRow {
    id: String,
    thread_id: String,
    user_id: String,
    object_key: String,
    file_name: String,
    content_type: String,
    size: i64,
    created_at: i64,
    is_encrypted: bool,
    iv: Option<Vec<u8>>,
    auth_tag: Option<Vec<u8>>,
    key_version: Option<i64>,
}

impl TryFrom<AttachmentRow> for AttachmentRecord {
    type Error = StorageError;

    fn try_from(row: AttachmentRow) -> Result<Self, Self::Error> {
        let protection = match (row.is_encrypted, row.iv, row.auth_tag, row.key_version) {
            (true, Some(iv), Some(auth_tag), Some(version)) => {
                AttachmentProtection::Encrypted(EnvelopeHeader::from_parts(
                    &iv,
                    &auth_tag,
                    parse_version(version)?,
                )?)
            }
            (false, None, None, None) => AttachmentProtection::Plaintext,
            _ => {
                return Err(StorageError::corrupt(
                    "attachment is_encrypted flag disagrees with header columns",
                ))
            }
        };

        Ok(AttachmentRecord {
            id: parse_id(&row.id)?,
            thread_id: parse_id(&row.thread_id)?,
            user_id: parse_user(row.user_id)?,
            object_key: row.object_key,
            file_name: row.file_name,
            content_type: row.content_type,
            size: row.size.max(0) as u64,
            created_at: row.created_at,
            protection,
        })
    }
}

fn parse_id<T>(value: &str) -> StorageResult<T>
where
    T: FromStr<Err = vault_types::TypeError>,
{
    value
        .parse()
        .map_err(|e: vault_types::TypeError| StorageError::corrupt(e.to_string()))
}

fn parse_user(value: String) -> StorageResult<UserId> {
    UserId::new(value).map_err(|e| StorageError::corrupt(e.to_string()))
}

fn parse_version(value: i64) -> StorageResult<KeyVersion> {
    KeyVersion::from_i64(value).map_err(|e| StorageError::corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SealedRecord;
    use vault_crypto::{CryptoError, Envelope};

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn sealed(tag: u8, version: u32) -> SealedRecord {
        SealedRecord {
            envelope: Envelope::from_parts(&[tag; 16], vec![tag; 8], &[tag; 16]).unwrap(),
            key_version: KeyVersion::new(version).unwrap(),
        }
    }

    async fn storage_with_thread(owner: &str) -> (SqliteStorage, ThreadRecord) {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let thread = ThreadRecord {
            id: ThreadId::new(),
            user_id: user(owner),
            title: "Trip planning".to_string(),
            created_at: 100,
            last_message_at: None,
        };
        storage.create_thread(&thread).await.unwrap();
        (storage, thread)
    }

    fn new_message(thread: &ThreadRecord, created_at: i64, sealed: SealedRecord) -> NewMessage {
        NewMessage {
            id: MessageId::new(),
            thread_id: thread.id,
            created_at,
            sealed,
        }
    }

    // ===========================================
    // Key metadata and history
    // ===========================================

    #[tokio::test]
    async fn key_meta_insert_is_idempotent() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");
        let first = Salt::random().unwrap();
        let second = Salt::random().unwrap();

        assert!(storage.insert_key_meta_if_absent(&alice, &first).await.unwrap());
        assert!(!storage.insert_key_meta_if_absent(&alice, &second).await.unwrap());

        let meta = storage.get_key_meta(&alice).await.unwrap().unwrap();
        assert_eq!(meta.salt, first);
        assert_eq!(meta.version, KeyVersion::INITIAL);
        assert_eq!(meta.rotated_at, None);

        // Version 1 is also in history
        let historical = storage
            .get_history_salt(&alice, KeyVersion::INITIAL)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(historical, first);
    }

    #[tokio::test]
    async fn missing_key_meta_is_none() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        assert!(storage.get_key_meta(&user("nobody")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reserve_history_salt_keeps_first_candidate() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");
        let v2 = KeyVersion::new(2).unwrap();
        let a = Salt::random().unwrap();
        let b = Salt::random().unwrap();

        assert_eq!(storage.reserve_history_salt(&alice, v2, &a).await.unwrap(), a);
        assert_eq!(storage.reserve_history_salt(&alice, v2, &b).await.unwrap(), a);
    }

    #[tokio::test]
    async fn flip_is_compare_and_swap() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");
        storage
            .insert_key_meta_if_absent(&alice, &Salt::random().unwrap())
            .await
            .unwrap();

        let v1 = KeyVersion::INITIAL;
        let v2 = v1.next().unwrap();
        let new_salt = Salt::random().unwrap();

        assert!(storage.flip_key_meta(&alice, v1, v2, &new_salt, 500).await.unwrap());
        // Second flip from the stale version loses
        assert!(!storage
            .flip_key_meta(&alice, v1, v2, &Salt::random().unwrap(), 600)
            .await
            .unwrap());

        let meta = storage.get_key_meta(&alice).await.unwrap().unwrap();
        assert_eq!(meta.version, v2);
        assert_eq!(meta.salt, new_salt);
        assert_eq!(meta.rotated_at, Some(500));
        assert_eq!(
            storage.get_history_salt(&alice, v2).await.unwrap().unwrap(),
            new_salt
        );
    }

    // ===========================================
    // Messages
    // ===========================================

    #[tokio::test]
    async fn insert_message_touches_thread() {
        let (storage, thread) = storage_with_thread("alice").await;
        let message = new_message(&thread, 250, sealed(1, 1));
        storage.insert_message(&message).await.unwrap();

        let thread = storage.get_thread(&thread.id).await.unwrap().unwrap();
        assert_eq!(thread.last_message_at, Some(250));

        let stored = storage.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.body, Stored::Sealed(sealed(1, 1)));
    }

    #[tokio::test]
    async fn insert_message_into_missing_thread_writes_nothing() {
        let (storage, _thread) = storage_with_thread("alice").await;
        let orphan = ThreadRecord {
            id: ThreadId::new(),
            user_id: user("alice"),
            title: String::new(),
            created_at: 0,
            last_message_at: None,
        };
        let message = new_message(&orphan, 1, sealed(1, 1));

        let err = storage.insert_message(&message).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { kind: "thread", .. }));
        assert!(storage.get_message(&message.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_messages_in_insertion_order() {
        let (storage, thread) = storage_with_thread("alice").await;
        let mut ids = Vec::new();
        for i in 0..5 {
            let message = new_message(&thread, 10, sealed(i, 1));
            ids.push(message.id);
            storage.insert_message(&message).await.unwrap();
        }

        let listed: Vec<MessageId> = storage
            .list_messages(&thread.id, None)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, ids);

        let limited = storage.list_messages(&thread.id, Some(2)).await.unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, ids[0]);
    }

    #[tokio::test]
    async fn sealed_messages_before_filters_by_owner_and_version() {
        let (storage, thread) = storage_with_thread("alice").await;
        let bob_thread = ThreadRecord {
            id: ThreadId::new(),
            user_id: user("bob"),
            title: "bob".to_string(),
            created_at: 0,
            last_message_at: None,
        };
        storage.create_thread(&bob_thread).await.unwrap();

        storage.insert_message(&new_message(&thread, 1, sealed(1, 1))).await.unwrap();
        storage.insert_message(&new_message(&thread, 2, sealed(2, 2))).await.unwrap();
        storage.insert_message(&new_message(&bob_thread, 3, sealed(3, 1))).await.unwrap();
        storage
            .insert_legacy_message(&MessageId::new(), &thread.id, 4, r#"{"role":"user","content":"x"}"#)
            .await
            .unwrap();

        let alice = user("alice");
        let v2 = KeyVersion::new(2).unwrap();
        let pending = storage.sealed_messages_before(&alice, v2, 100).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body.key_version(), Some(KeyVersion::INITIAL));
        assert_eq!(storage.count_sealed_messages_before(&alice, v2).await.unwrap(), 1);
        assert_eq!(storage.count_legacy_messages(&alice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reseal_skips_rows_not_at_previous_version() {
        let (storage, thread) = storage_with_thread("alice").await;
        let message = new_message(&thread, 1, sealed(1, 1));
        storage.insert_message(&message).await.unwrap();

        let v1 = KeyVersion::INITIAL;
        let first = MessageReseal {
            id: message.id,
            previous_version: Some(v1),
            sealed: sealed(9, 2),
        };
        assert_eq!(storage.reseal_messages(&[first.clone()]).await.unwrap(), 1);
        // Replaying the same batch is a no-op
        assert_eq!(storage.reseal_messages(&[first]).await.unwrap(), 0);

        let stored = storage.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.body, Stored::Sealed(sealed(9, 2)));
    }

    #[tokio::test]
    async fn reseal_legacy_clears_plaintext() {
        let (storage, thread) = storage_with_thread("alice").await;
        let id = MessageId::new();
        storage
            .insert_legacy_message(&id, &thread.id, 1, r#"{"role":"user","content":"old"}"#)
            .await
            .unwrap();

        let legacy = storage.legacy_messages(&user("alice"), 10).await.unwrap();
        assert_eq!(legacy.len(), 1);
        assert!(matches!(legacy[0].body, Stored::Plaintext(_)));

        let reseal = MessageReseal {
            id,
            previous_version: None,
            sealed: sealed(5, 1),
        };
        assert_eq!(storage.reseal_messages(&[reseal]).await.unwrap(), 1);

        let stored = storage.get_message(&id).await.unwrap().unwrap();
        assert_eq!(stored.body, Stored::Sealed(sealed(5, 1)));
        assert_eq!(storage.count_legacy_messages(&user("alice")).await.unwrap(), 0);
    }

    // ===========================================
    // Attachments
    // ===========================================

    fn attachment(thread: &ThreadRecord, protection: AttachmentProtection) -> AttachmentRecord {
        AttachmentRecord {
            id: AttachmentId::new(),
            thread_id: thread.id,
            user_id: thread.user_id.clone(),
            object_key: "alice/a1".to_string(),
            file_name: "notes.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 1234,
            created_at: 5,
            protection,
        }
    }

    #[tokio::test]
    async fn attachment_round_trip_and_reseal() {
        let (storage, thread) = storage_with_thread("alice").await;
        let header = EnvelopeHeader {
            iv: [1; 16],
            auth_tag: [2; 16],
            key_version: KeyVersion::INITIAL,
        };
        let record = attachment(&thread, AttachmentProtection::Encrypted(header));
        storage.insert_attachment(&record).await.unwrap();

        let loaded = storage.get_attachment(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.protection, AttachmentProtection::Encrypted(header));
        assert_eq!(loaded.size, 1234);

        let alice = user("alice");
        let v2 = KeyVersion::new(2).unwrap();
        assert_eq!(storage.sealed_attachments_before(&alice, v2, 10).await.unwrap().len(), 1);

        let new_header = EnvelopeHeader {
            iv: [3; 16],
            auth_tag: [4; 16],
            key_version: v2,
        };
        let reseal = AttachmentReseal {
            id: record.id,
            previous_version: Some(KeyVersion::INITIAL),
            object_key: "alice/a1.v2".to_string(),
            header: new_header,
        };
        assert_eq!(storage.reseal_attachments(&[reseal]).await.unwrap(), 1);

        let loaded = storage.get_attachment(&record.id).await.unwrap().unwrap();
        assert_eq!(loaded.object_key, "alice/a1.v2");
        assert_eq!(loaded.protection, AttachmentProtection::Encrypted(new_header));
        assert_eq!(storage.count_sealed_attachments_before(&alice, v2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn plaintext_attachment_lists_and_deletes() {
        let (storage, thread) = storage_with_thread("alice").await;
        let record = attachment(&thread, AttachmentProtection::Plaintext);
        storage.insert_attachment(&record).await.unwrap();

        let listed = storage.list_attachments(&thread.id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].protection, AttachmentProtection::Plaintext);

        assert!(storage.delete_attachment(&record.id).await.unwrap());
        assert!(!storage.delete_attachment(&record.id).await.unwrap());
    }

    #[tokio::test]
    async fn short_iv_is_a_malformed_envelope_for_attachments_and_messages() {
        let (storage, thread) = storage_with_thread("alice").await;
        let header = EnvelopeHeader {
            iv: [1; 16],
            auth_tag: [2; 16],
            key_version: KeyVersion::INITIAL,
        };
        let record = attachment(&thread, AttachmentProtection::Encrypted(header));
        storage.insert_attachment(&record).await.unwrap();
        let message = new_message(&thread, 1, sealed(7, 1));
        storage.insert_message(&message).await.unwrap();

        sqlx::query("UPDATE attachments SET iv = ? WHERE id = ?")
            .bind(vec![0u8; 12])
            .bind(record.id.to_string())
            .execute(&storage.pool)
            .await
            .unwrap();
        sqlx::query("UPDATE messages SET iv = ? WHERE id = ?")
            .bind(vec![0u8; 12])
            .bind(message.id.to_string())
            .execute(&storage.pool)
            .await
            .unwrap();

        let err = storage.get_attachment(&record.id).await.unwrap_err();
        assert!(
            matches!(err, StorageError::Envelope(CryptoError::MalformedEnvelope { .. })),
            "got {:?}",
            err
        );
        let err = storage.get_message(&message.id).await.unwrap_err();
        assert!(matches!(err, StorageError::Envelope(CryptoError::MalformedEnvelope { .. })));
    }

    // ===========================================
    // Settings
    // ===========================================

    #[tokio::test]
    async fn credential_put_replaces_and_keeps_other_providers() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");

        storage.put_credential(&alice, "openai", "aa:bb:cc").await.unwrap();
        storage.put_credential(&alice, "anthropic", "11:22:33").await.unwrap();
        storage.put_credential(&alice, "openai", "dd:ee:ff").await.unwrap();

        assert_eq!(
            storage.get_credential(&alice, "openai").await.unwrap().as_deref(),
            Some("dd:ee:ff")
        );
        assert_eq!(
            storage.credential_providers(&alice).await.unwrap(),
            vec!["anthropic".to_string(), "openai".to_string()]
        );
    }

    #[tokio::test]
    async fn credential_delete() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");

        assert!(!storage.delete_credential(&alice, "openai").await.unwrap());
        storage.put_credential(&alice, "openai", "aa:bb:cc").await.unwrap();
        assert!(storage.delete_credential(&alice, "openai").await.unwrap());
        assert!(storage.get_credential(&alice, "openai").await.unwrap().is_none());
        assert!(storage.credential_providers(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn provider_names_with_dots_are_single_keys() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        let alice = user("alice");
        storage.put_credential(&alice, "azure.openai", "aa:bb:cc").await.unwrap();
        assert_eq!(
            storage.get_credential(&alice, "azure.openai").await.unwrap().as_deref(),
            Some("aa:bb:cc")
        );
    }

    // ===========================================
    // On-disk database
    // ===========================================

    #[tokio::test]
    async fn on_disk_database_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.db");
        let alice = user("alice");
        let salt = Salt::random().unwrap();

        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage.insert_key_meta_if_absent(&alice, &salt).await.unwrap();
        }

        let reopened = SqliteStorage::new(&path).await.unwrap();
        let meta = reopened.get_key_meta(&alice).await.unwrap().unwrap();
        assert_eq!(meta.salt, salt);
    }
}

//! The assembled vault: one instance per process, constructed at startup.

use std::sync::Arc;
use vault_crypto::{KdfParams, KeyDeriver};
use vault_store::{
    AttachmentStore, FsObjectStore, KeyMetaStore, MessageStore, ObjectStore, SettingsStore,
    SqliteStorage,
};
use vault_types::{KeyVersion, UserId};

use crate::attachments::AttachmentVault;
use crate::config::{Config, Secrets};
use crate::credentials::CredentialVault;
use crate::error::{Result, VaultError};
use crate::keys::KeyRing;
use crate::messages::MessageVault;
use crate::rotation::{AttachmentContent, MessageContent, RotatableContent, RotationEngine, RotationReport};

/// The collaborators a vault is built from.
#[derive(Clone)]
pub struct VaultStores {
    /// Key metadata and salt history.
    pub key_meta: Arc<dyn KeyMetaStore>,
    /// Threads and messages.
    pub messages: Arc<dyn MessageStore>,
    /// Attachment rows.
    pub attachments: Arc<dyn AttachmentStore>,
    /// Settings blobs holding credentials.
    pub settings: Arc<dyn SettingsStore>,
    /// Attachment bytes.
    pub objects: Arc<dyn ObjectStore>,
}

impl VaultStores {
    /// Use one SQLite database for every row store.
    pub fn sqlite(storage: SqliteStorage, objects: Arc<dyn ObjectStore>) -> Self {
        let storage = Arc::new(storage);
        Self {
            key_meta: storage.clone(),
            messages: storage.clone(),
            attachments: storage.clone(),
            settings: storage,
            objects,
        }
    }
}

/// Rotation and legacy-migration state for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStatus {
    /// The user.
    pub user: UserId,
    /// Current key version.
    pub version: KeyVersion,
    /// Unix time of the last completed rotation.
    pub rotated_at: Option<i64>,
    /// Rows still sealed below the current version, per content provider.
    pub behind_current: Vec<(&'static str, u64)>,
    /// Legacy plaintext message rows.
    pub legacy_messages: u64,
}

/// Key ring, rotation engine and content facades wired together.
pub struct Vault {
    keys: Arc<KeyRing>,
    messages: MessageVault,
    attachments: AttachmentVault,
    credentials: CredentialVault,
    rotation: RotationEngine,
    message_store: Arc<dyn MessageStore>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("keys", &self.keys)
            .field("rotation", &self.rotation)
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Assemble a vault from explicit collaborators.
    pub fn new(secrets: &Secrets, params: KdfParams, stores: VaultStores) -> Result<Self> {
        let deriver = KeyDeriver::new(params);
        let keys = Arc::new(KeyRing::new(
            stores.key_meta.clone(),
            deriver,
            secrets.master_secret(),
        ));

        let providers: Vec<Arc<dyn RotatableContent>> = vec![
            Arc::new(MessageContent::new(stores.messages.clone())),
            Arc::new(AttachmentContent::new(
                stores.attachments.clone(),
                stores.objects.clone(),
            )),
        ];

        Ok(Self {
            messages: MessageVault::new(keys.clone(), stores.messages.clone()),
            attachments: AttachmentVault::new(
                keys.clone(),
                stores.messages.clone(),
                stores.attachments,
                stores.objects,
            ),
            credentials: CredentialVault::new(secrets, &deriver, stores.settings)?,
            rotation: RotationEngine::new(keys.clone(), providers),
            message_store: stores.messages,
            keys,
        })
    }

    /// Open the SQLite database and filesystem object store named by
    /// `config`, with production KDF parameters.
    ///
    /// # Errors
    ///
    /// `ConfigurationMissing` or `ConfigurationInvalid` before touching
    /// storage if either secret is absent or the credential salt is too
    /// short.
    pub async fn open(config: &Config) -> Result<Self> {
        let secrets = config.secrets()?;
        let storage = SqliteStorage::new(&config.storage.database).await?;
        let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.objects.root));
        Self::new(&secrets, KdfParams::PRODUCTION, VaultStores::sqlite(storage, objects))
    }

    /// Per-user key ring.
    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Message facade.
    pub fn messages(&self) -> &MessageVault {
        &self.messages
    }

    /// Attachment facade.
    pub fn attachments(&self) -> &AttachmentVault {
        &self.attachments
    }

    /// Credential facade.
    pub fn credentials(&self) -> &CredentialVault {
        &self.credentials
    }

    /// Rotate `user` to a new key version.
    pub async fn rotate(&self, user: &UserId) -> Result<RotationReport> {
        self.rotation.rotate(user).await
    }

    /// Seal the user's legacy plaintext messages.
    pub async fn encrypt_legacy(&self, user: &UserId) -> Result<u64> {
        self.messages.encrypt_legacy(user).await
    }

    /// Current key version and migration backlog for `user`.
    pub async fn key_status(&self, user: &UserId) -> Result<KeyStatus> {
        let meta = self
            .keys
            .get(user)
            .await?
            .ok_or_else(|| VaultError::KeyNotProvisioned { user: user.clone() })?;

        Ok(KeyStatus {
            user: user.clone(),
            version: meta.version,
            rotated_at: meta.rotated_at,
            behind_current: self.rotation.pending(user, meta.version).await?,
            legacy_messages: self.message_store.count_legacy_messages(user).await?,
        })
    }
}

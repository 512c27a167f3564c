//! Per-user key ring.
//!
//! Owns all access to key metadata. Everything else asks the ring for keys:
//!
//! - [`KeyRing::current_key`] provisions lazily and returns the key new
//!   ciphertext is sealed under
//! - [`KeyRing::key_for_version`] resolves the key a row was sealed under,
//!   through the salt history, so rows mid-rotation stay readable
//!
//! Derived keys are cached per `(user, version)`. A version's salt never
//! changes once recorded, so cache entries never go stale.

use dashmap::DashMap;
use std::sync::Arc;
use vault_crypto::{DerivedKey, KeyDeriver, Salt};
use vault_store::{unix_timestamp, KeyMeta, KeyMetaStore};
use vault_types::{KeyVersion, UserId};
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Cached derived keys before the cache is cleared.
const KEY_CACHE_CAPACITY: usize = 1024;

/// Per-user key metadata and derivation.
pub struct KeyRing {
    store: Arc<dyn KeyMetaStore>,
    deriver: KeyDeriver,
    master_secret: Zeroizing<Vec<u8>>,
    cache: DashMap<(UserId, KeyVersion), DerivedKey>,
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("params", &self.deriver.params())
            .field("cached_keys", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl KeyRing {
    /// Create a key ring over a metadata store.
    pub fn new(store: Arc<dyn KeyMetaStore>, deriver: KeyDeriver, master_secret: &[u8]) -> Self {
        Self {
            store,
            deriver,
            master_secret: Zeroizing::new(master_secret.to_vec()),
            cache: DashMap::new(),
        }
    }

    /// Current key metadata, if provisioned.
    pub async fn get(&self, user: &UserId) -> Result<Option<KeyMeta>> {
        Ok(self.store.get_key_meta(user).await?)
    }

    /// Current key metadata, provisioning version 1 on first use.
    ///
    /// Concurrent first calls for the same user all observe the same salt:
    /// the insert is a no-op on conflict and everyone reads back the winner.
    pub async fn get_or_create(&self, user: &UserId) -> Result<KeyMeta> {
        if let Some(meta) = self.store.get_key_meta(user).await? {
            return Ok(meta);
        }

        let candidate = Salt::random()?;
        if self.store.insert_key_meta_if_absent(user, &candidate).await? {
            tracing::info!("Provisioned encryption key for user {}", user);
        }

        self.store
            .get_key_meta(user)
            .await?
            .ok_or_else(|| VaultError::KeyNotProvisioned { user: user.clone() })
    }

    /// Key and version new ciphertext for `user` is sealed under.
    pub async fn current_key(&self, user: &UserId) -> Result<(KeyVersion, DerivedKey)> {
        let meta = self.get_or_create(user).await?;
        let key = self.derive(user, meta.version, &meta.salt)?;
        Ok((meta.version, key))
    }

    /// Key for a specific, possibly historical, version.
    ///
    /// # Errors
    ///
    /// `KeyNotProvisioned` if no salt is on record for that version.
    pub async fn key_for_version(&self, user: &UserId, version: KeyVersion) -> Result<DerivedKey> {
        if let Some(key) = self.cache.get(&(user.clone(), version)) {
            return Ok(key.clone());
        }

        let salt = match self.store.get_history_salt(user, version).await? {
            Some(salt) => salt,
            // Metadata provisioned without a history row still resolves its
            // own current version.
            None => match self.store.get_key_meta(user).await? {
                Some(meta) if meta.version == version => meta.salt,
                _ => return Err(VaultError::KeyNotProvisioned { user: user.clone() }),
            },
        };

        self.derive(user, version, &salt)
    }

    /// Reserve the salt for an upcoming version. A retried reservation
    /// returns the salt recorded by the first one.
    pub(crate) async fn reserve(&self, user: &UserId, version: KeyVersion) -> Result<Salt> {
        let candidate = Salt::random()?;
        Ok(self
            .store
            .reserve_history_salt(user, version, &candidate)
            .await?)
    }

    /// Flip current metadata from `from` to `to`. Returns false if another
    /// writer changed the version first.
    pub(crate) async fn flip(
        &self,
        user: &UserId,
        from: KeyVersion,
        to: KeyVersion,
        salt: &Salt,
    ) -> Result<bool> {
        Ok(self
            .store
            .flip_key_meta(user, from, to, salt, unix_timestamp())
            .await?)
    }

    /// Derive (or fetch from cache) the key for `version` under `salt`.
    pub(crate) fn derive(
        &self,
        user: &UserId,
        version: KeyVersion,
        salt: &Salt,
    ) -> Result<DerivedKey> {
        let cache_key = (user.clone(), version);
        if let Some(key) = self.cache.get(&cache_key) {
            return Ok(key.clone());
        }

        let key = self
            .deriver
            .derive_for_user(&self.master_secret, user, salt)?;

        if self.cache.len() >= KEY_CACHE_CAPACITY {
            self.cache.clear();
        }
        self.cache.insert(cache_key, key.clone());
        Ok(key)
    }

    /// Number of cached derived keys.
    pub fn cached_keys(&self) -> usize {
        self.cache.len()
    }
}

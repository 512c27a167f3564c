//! Third-party API credentials.
//!
//! Credentials use one global key derived from the master secret and the
//! configured credential salt, not the per-user key ring. They are replaced
//! wholesale, never rotated row by row. Stored form is
//! `hex(iv):hex(ciphertext):hex(tag)` under `apiKeys.<provider>` in the
//! user's settings blob.

use std::sync::Arc;
use vault_crypto::{open, seal, DerivedKey, Envelope, KeyDeriver};
use vault_store::SettingsStore;
use vault_types::UserId;
use zeroize::{Zeroize, Zeroizing};

use crate::config::Secrets;
use crate::error::{Result, VaultError};

/// Seals and opens provider API keys.
pub struct CredentialVault {
    key: DerivedKey,
    store: Arc<dyn SettingsStore>,
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /// Derive the global key and create the credential facade.
    pub fn new(secrets: &Secrets, deriver: &KeyDeriver, store: Arc<dyn SettingsStore>) -> Result<Self> {
        let key = deriver.derive_global(secrets.master_secret(), secrets.credential_salt())?;
        Ok(Self { key, store })
    }

    /// Encrypt and store `api_key`, replacing any previous value for the
    /// provider.
    pub async fn set(&self, user: &UserId, provider: &str, api_key: &str) -> Result<()> {
        let encoded = seal(api_key.as_bytes(), &self.key)?.to_credential_string();
        self.store.put_credential(user, provider, &encoded).await?;
        tracing::info!("Stored {} credential for user {}", provider, user);
        Ok(())
    }

    /// Decrypt the stored credential for a provider.
    ///
    /// # Errors
    ///
    /// `MalformedEnvelope` if the stored string is not three hex fields,
    /// `DecryptionFailed` if it does not authenticate. Neither is ever turned
    /// into `Ok(None)`.
    pub async fn get(&self, user: &UserId, provider: &str) -> Result<Option<Zeroizing<String>>> {
        let Some(encoded) = self.store.get_credential(user, provider).await? else {
            return Ok(None);
        };

        let envelope = Envelope::from_credential_string(&encoded)?;
        let mut plaintext = open(&envelope, &self.key).map_err(|e| {
            tracing::error!("Stored {} credential for user {} is unusable: {}", provider, user, e);
            VaultError::from(e)
        })?;

        match String::from_utf8(std::mem::take(&mut *plaintext)) {
            Ok(api_key) => Ok(Some(Zeroizing::new(api_key))),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(VaultError::MalformedEnvelope {
                    reason: "credential is not UTF-8".to_string(),
                })
            }
        }
    }

    /// Remove a provider's credential. Returns whether one was stored.
    pub async fn delete(&self, user: &UserId, provider: &str) -> Result<bool> {
        let removed = self.store.delete_credential(user, provider).await?;
        if removed {
            tracing::info!("Deleted {} credential for user {}", provider, user);
        }
        Ok(removed)
    }

    /// Providers with a stored credential.
    pub async fn providers(&self, user: &UserId) -> Result<Vec<String>> {
        Ok(self.store.credential_providers(user).await?)
    }
}

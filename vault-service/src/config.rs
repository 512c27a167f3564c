//! Configuration loading for chatvault.
//!
//! Configuration is loaded from a TOML file (default: `chatvault.toml`).
//! The two secrets may instead come from the environment, which wins over
//! the file:
//!
//! - `CHATVAULT_MASTER_SECRET`
//! - `CHATVAULT_CREDENTIAL_SALT`

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use vault_crypto::MIN_SALT_SIZE;
use zeroize::Zeroizing;

use crate::error::VaultError;

/// Environment variable overriding `crypto.master_secret`.
pub const MASTER_SECRET_ENV: &str = "CHATVAULT_MASTER_SECRET";
/// Environment variable overriding `crypto.credential_salt`.
pub const CREDENTIAL_SALT_ENV: &str = "CHATVAULT_CREDENTIAL_SALT";

/// Root configuration for chatvault.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Secrets for key derivation.
    #[serde(default)]
    pub crypto: CryptoConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Object store configuration.
    #[serde(default)]
    pub objects: ObjectsConfig,
}

/// Key derivation secrets.
#[derive(Clone, Default, Deserialize)]
pub struct CryptoConfig {
    /// Master secret every per-user and global key is derived from.
    pub master_secret: Option<String>,
    /// Fixed salt for the global credential key.
    pub credential_salt: Option<String>,
}

impl fmt::Debug for CryptoConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoConfig")
            .field("master_secret", &self.master_secret.as_ref().map(|_| "[REDACTED]"))
            .field("credential_salt", &self.credential_salt.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ObjectsConfig {
    /// Root directory of the filesystem object store.
    #[serde(default = "default_objects_root")]
    pub root: PathBuf,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("chatvault.db")
}

fn default_objects_root() -> PathBuf {
    PathBuf::from("objects")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
        }
    }
}

impl Default for ObjectsConfig {
    fn default() -> Self {
        Self {
            root: default_objects_root(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Apply `CHATVAULT_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(secret) = lookup(MASTER_SECRET_ENV) {
            self.crypto.master_secret = Some(secret);
        }
        if let Some(salt) = lookup(CREDENTIAL_SALT_ENV) {
            self.crypto.credential_salt = Some(salt);
        }
    }

    /// Validate and extract the secrets.
    ///
    /// # Errors
    ///
    /// - `ConfigurationMissing` if either secret is absent or empty
    /// - `ConfigurationInvalid` if the credential salt is shorter than
    ///   [`MIN_SALT_SIZE`] bytes
    pub fn secrets(&self) -> Result<Secrets, VaultError> {
        let master_secret = non_empty(&self.crypto.master_secret, "crypto.master_secret")?;
        let credential_salt = non_empty(&self.crypto.credential_salt, "crypto.credential_salt")?;
        if credential_salt.len() < MIN_SALT_SIZE {
            return Err(VaultError::ConfigurationInvalid {
                field: "crypto.credential_salt",
                reason: format!(
                    "must be at least {} bytes, got {}",
                    MIN_SALT_SIZE,
                    credential_salt.len()
                ),
            });
        }
        Ok(Secrets {
            master_secret,
            credential_salt,
        })
    }
}

fn non_empty(value: &Option<String>, field: &'static str) -> Result<Zeroizing<String>, VaultError> {
    match value {
        Some(v) if !v.is_empty() => Ok(Zeroizing::new(v.clone())),
        _ => Err(VaultError::ConfigurationMissing { field }),
    }
}

/// Validated secrets, zeroized on drop.
#[derive(Clone)]
pub struct Secrets {
    master_secret: Zeroizing<String>,
    credential_salt: Zeroizing<String>,
}

impl Secrets {
    /// Build secrets directly, applying the same checks as [`Config::secrets`].
    pub fn new(master_secret: &str, credential_salt: &str) -> Result<Self, VaultError> {
        Config {
            crypto: CryptoConfig {
                master_secret: Some(master_secret.to_string()),
                credential_salt: Some(credential_salt.to_string()),
            },
            ..Config::default()
        }
        .secrets()
    }

    /// Master secret bytes.
    pub fn master_secret(&self) -> &[u8] {
        self.master_secret.as_bytes()
    }

    /// Global credential salt bytes.
    pub fn credential_salt(&self) -> &[u8] {
        self.credential_salt.as_bytes()
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secrets([REDACTED])")
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

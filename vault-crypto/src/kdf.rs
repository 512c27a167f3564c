//! Memory-hard key derivation.
//!
//! Two derivation patterns share one function:
//!
//! - **global**: `argon2id(master_secret, configured_salt)`, same key every
//!   call, used only for stored third-party credentials
//! - **per-user**: `argon2id(master_secret || ":" || user_id, user_salt)`,
//!   one key per user per rotation epoch
//!
//! Derivation is deterministic. Rotation depends on that to re-derive the
//! old key before re-encrypting under a new one.

use argon2::{Algorithm, Argon2, Params, Version};
use std::fmt;
use vault_types::UserId;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;

/// Derived key size (256 bits = 32 bytes).
pub const KEY_SIZE: usize = 32;

/// Per-user salt size (256 bits = 32 bytes).
pub const SALT_SIZE: usize = 32;

/// Shortest salt accepted for the global derivation.
pub const MIN_SALT_SIZE: usize = 16;

/// Argon2id work factors.
///
/// Fixed at build time: changing them changes every derived key, which
/// would strand all existing ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl KdfParams {
    /// Production parameters: 19 MiB, 2 passes, 1 lane.
    pub const PRODUCTION: KdfParams = KdfParams {
        memory_kib: 19 * 1024,
        iterations: 2,
        parallelism: 1,
    };

    /// Minimal parameters for unit and scenario tests. Never use for real data.
    pub const fn for_tests() -> Self {
        Self {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    /// Memory cost in KiB.
    pub fn memory_kib(&self) -> u32 {
        self.memory_kib
    }

    /// Iteration count.
    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn to_argon2_params(self) -> Result<Params, CryptoError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::PRODUCTION
    }
}

/// A 256-bit symmetric key. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Don't leak keys in debug output
impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedKey([REDACTED])")
    }
}

/// A per-user, per-version random salt.
///
/// Never logged or transmitted; zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Salt([u8; SALT_SIZE]);

impl Salt {
    /// Draw a fresh salt from the OS random source.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; SALT_SIZE];
        getrandom::getrandom(&mut bytes).map_err(|e| CryptoError::Rng(e.to_string()))?;
        Ok(Self(bytes))
    }

    /// Load a stored salt, rejecting anything that is not exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        <[u8; SALT_SIZE]>::try_from(bytes)
            .map(Self)
            .map_err(|_| CryptoError::InvalidSalt {
                expected: SALT_SIZE,
                actual: bytes.len(),
            })
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; SALT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Salt([REDACTED])")
    }
}

/// Argon2id key deriver bound to one parameter set.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver {
    params: KdfParams,
}

impl KeyDeriver {
    /// Create a deriver with explicit parameters.
    pub fn new(params: KdfParams) -> Self {
        Self { params }
    }

    /// Parameters in use.
    pub fn params(&self) -> KdfParams {
        self.params
    }

    /// Derive the global credential key from the master secret and the
    /// configured fixed salt.
    pub fn derive_global(&self, master_secret: &[u8], salt: &[u8]) -> Result<DerivedKey, CryptoError> {
        if salt.len() < MIN_SALT_SIZE {
            return Err(CryptoError::InvalidSalt {
                expected: MIN_SALT_SIZE,
                actual: salt.len(),
            });
        }
        self.derive(master_secret, salt)
    }

    /// Derive a user's content key for one salt generation.
    pub fn derive_for_user(
        &self,
        master_secret: &[u8],
        user: &UserId,
        salt: &Salt,
    ) -> Result<DerivedKey, CryptoError> {
        let secret = user_secret(master_secret, user);
        self.derive(&secret, salt.as_bytes())
    }

    fn derive(&self, secret: &[u8], salt: &[u8]) -> Result<DerivedKey, CryptoError> {
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            self.params.to_argon2_params()?,
        );

        let mut output = [0u8; KEY_SIZE];
        let result = argon2.hash_password_into(secret, salt, &mut output);
        let key = DerivedKey(output);
        output.zeroize();
        result.map_err(|e| CryptoError::KeyDerivationFailed(e.to_string()))?;

        Ok(key)
    }
}

/// `master_secret || ":" || user_id`
fn user_secret(master_secret: &[u8], user: &UserId) -> Zeroizing<Vec<u8>> {
    let user = user.as_str().as_bytes();
    let mut secret = Zeroizing::new(Vec::with_capacity(master_secret.len() + 1 + user.len()));
    secret.extend_from_slice(master_secret);
    secret.push(b':');
    secret.extend_from_slice(user);
    secret
}

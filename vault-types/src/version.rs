//! Key version (rotation epoch).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TypeError;

/// Monotonic counter naming the salt generation that protects a row.
///
/// Starts at 1 and only ever increases by one per completed rotation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyVersion(u32);

impl KeyVersion {
    /// The version assigned when a user's key metadata is first provisioned.
    pub const INITIAL: KeyVersion = KeyVersion(1);

    /// Create a KeyVersion; zero is not a valid version.
    pub fn new(version: u32) -> Result<Self, TypeError> {
        if version == 0 {
            return Err(TypeError::InvalidKeyVersion(0));
        }
        Ok(Self(version))
    }

    /// Convert from a database integer column.
    pub fn from_i64(value: i64) -> Result<Self, TypeError> {
        u32::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .map(Self)
            .ok_or(TypeError::InvalidKeyVersion(value))
    }

    /// The version a rotation moves to.
    ///
    /// Fails at `u32::MAX`; a version is never reused.
    pub fn next(self) -> Result<Self, TypeError> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or(TypeError::VersionExhausted)
    }

    /// Raw value.
    pub fn value(self) -> u32 {
        self.0
    }

    /// Value for a database integer column.
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }
}

impl Default for KeyVersion {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl fmt::Debug for KeyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyVersion({})", self.0)
    }
}

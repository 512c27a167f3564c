//! # vault-crypto
//!
//! Cryptographic primitives for the chatvault confidentiality layer.
//!
//! This crate provides:
//! - [`seal`] / [`open`] - AES-256-GCM over a self-contained [`Envelope`]
//!   (16-byte IV, ciphertext, 16-byte tag)
//! - [`KeyDeriver`] - Argon2id stretching of a secret and salt into a
//!   32-byte [`DerivedKey`], in a global and a per-user flavour
//! - [`Envelope::to_credential_string`] - the `hex(iv):hex(ct):hex(tag)`
//!   form used for stored API credentials
//!
//! ## Envelope Layout
//!
//! ```text
//! plaintext ──AES-256-GCM(key, random IV)──► ┌────────┬────────────┬─────────┐
//!                                            │ iv:16  │ ciphertext │ tag:16  │
//!                                            └────────┴────────────┴─────────┘
//!   rows:        iv BLOB | ciphertext BLOB | auth_tag BLOB | key_version INT
//!   credentials: "<hex iv>:<hex ciphertext>:<hex tag>"
//! ```
//!
//! Nothing here performs I/O. All transforms are synchronous and CPU-bound.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod aead;
mod error;
mod kdf;

pub use aead::{open, seal, Envelope, IV_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use kdf::{DerivedKey, KdfParams, KeyDeriver, Salt, KEY_SIZE, MIN_SALT_SIZE, SALT_SIZE};

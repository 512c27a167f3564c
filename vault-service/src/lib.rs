//! # vault-service
//!
//! Confidentiality layer for chat data at rest.
//!
//! ```text
//!  message / attachment / credential (plaintext)
//!            │
//!   ┌────────▼─────────┐      ┌────────────┐
//!   │  facades         │─────►│  KeyRing   │── key_meta + key_history
//!   │  (seal / open)   │      └─────▲──────┘
//!   └────────┬─────────┘            │
//!            │               ┌──────┴─────────┐
//!            ▼               │ RotationEngine │── messages, attachments
//!   rows: iv | ciphertext | auth_tag | key_version
//! ```
//!
//! - [`KeyRing`] provisions per-user salts lazily and derives keys for any
//!   recorded version
//! - [`RotationEngine`] re-encrypts a user's rows in batches of
//!   [`BATCH_SIZE`] and flips the key version only when nothing is left
//! - [`MessageVault`], [`AttachmentVault`], [`CredentialVault`] move between
//!   plaintext domain objects and sealed rows
//! - [`Vault`] wires them together from [`Config`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod attachments;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod messages;
pub mod rotation;
pub mod vault;

pub use attachments::{AttachmentVault, NewAttachment};
pub use config::{Config, ConfigError, Secrets};
pub use credentials::CredentialVault;
pub use error::{Result, VaultError};
pub use keys::KeyRing;
pub use messages::{Message, MessageEntry, MessageVault, PreviewLine, Readable, SharePreview};
pub use rotation::{
    AttachmentContent, BatchOutcome, MessageContent, RotatableContent, RotationEngine,
    RotationReport, BATCH_SIZE,
};
pub use vault::{KeyStatus, Vault, VaultStores};

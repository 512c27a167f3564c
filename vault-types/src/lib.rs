//! # vault-types
//!
//! Identifier and domain types shared by every chatvault crate.
//!
//! - [`UserId`], [`ThreadId`], [`MessageId`], [`AttachmentId`] - ownership and row identity
//! - [`KeyVersion`] - rotation epoch recorded on every sealed row
//! - [`MessageBody`], [`MessageRole`] - the plaintext chat message object
//! - [`TypeError`] - parse errors for the above

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod message;
mod version;

pub use error::TypeError;
pub use ids::{AttachmentId, MessageId, ThreadId, UserId};
pub use message::{MessageBody, MessageRole};
pub use version::KeyVersion;

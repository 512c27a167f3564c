//! Plaintext chat message object.
//!
//! This is the value sealed into a message row's envelope. It never reaches
//! storage in clear except in legacy rows written before encryption existed.

use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// End user input.
    User,
    /// Model response.
    Assistant,
    /// System prompt or instruction.
    System,
    /// Tool call output.
    Tool,
}

/// The structured body of one chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Who wrote the message.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    /// Model that produced an assistant message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl MessageBody {
    /// Convenience constructor for a user-authored message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            model: None,
        }
    }

    /// Convenience constructor for an assistant message.
    pub fn assistant(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            model: Some(model.into()),
        }
    }
}

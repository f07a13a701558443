//! Shared types for the parley voice-conversation platform.
//!
//! This crate provides the foundational types used across all parley crates:
//! conversation message roles, the message record itself, and voice
//! configuration for the synthesis backend.
//!
//! No crate in the workspace depends on anything *except* `parley-types` for
//! cross-cutting type definitions. This keeps the dependency graph clean and
//! prevents circular dependencies.

pub mod voice;

use serde::{Deserialize, Serialize};

/// The author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The human speaking to the agent.
    User,
    /// The agent's generated reply.
    Assistant,
}

impl Role {
    /// Returns the string label for this role, as stored in history and
    /// sent to the generation backend.
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Attempts to parse a role from its string label.
    ///
    /// Returns `None` for unrecognized labels.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// One entry in a session's conversation history.
///
/// History is append-only; `ordinal` is the message's position within its
/// session, assigned by the history store at append time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Who authored the message.
    pub role: Role,
    /// The message text.
    pub text: String,
    /// Position within the session, starting at 0.
    pub ordinal: u64,
}

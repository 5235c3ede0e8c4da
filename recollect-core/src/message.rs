//! Chat messages as seen by the memory engine.
//!
//! Messages belong to the host. The engine reads their text and only ever
//! writes the derived `excluded_from_context` flag.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of the message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Message from the user
    User,
    /// Message from the character being played
    Character,
    /// System or narrator message
    System,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Character => write!(f, "character"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Host rendering hints carried alongside a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderFlags {
    /// Hidden from the user but still part of the transcript.
    #[serde(default)]
    pub hidden: bool,
    /// Message is a swipe/alternate still being chosen.
    #[serde(default)]
    pub pending: bool,
}

/// A single message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Position in the transcript.
    pub index: usize,
    /// Display name of the sender.
    pub speaker: String,
    /// Raw message text.
    pub text: String,
    /// Who sent it.
    pub role: Role,
    /// Rendering hints.
    #[serde(default)]
    pub render_flags: RenderFlags,
    /// Set by retention when the message should be left out of the next
    /// generation request. Never implies deletion.
    #[serde(default)]
    pub excluded_from_context: bool,
}

impl ChatMessage {
    /// Create a new message.
    pub fn new(index: usize, speaker: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
        Self {
            index,
            speaker: speaker.into(),
            text: text.into(),
            role,
            render_flags: RenderFlags::default(),
            excluded_from_context: false,
        }
    }

    /// Create a user message.
    pub fn user(index: usize, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(index, speaker, Role::User, text)
    }

    /// Create a character message.
    pub fn character(index: usize, speaker: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(index, speaker, Role::Character, text)
    }

    /// Create a system message.
    pub fn system(index: usize, text: impl Into<String>) -> Self {
        Self::new(index, "System", Role::System, text)
    }
}

/// Build a transcript from `(speaker, role, text)` triples, numbering
/// messages from zero.
pub fn transcript<I, S, T>(entries: I) -> Vec<ChatMessage>
where
    I: IntoIterator<Item = (S, Role, T)>,
    S: Into<String>,
    T: Into<String>,
{
    entries
        .into_iter()
        .enumerate()
        .map(|(i, (speaker, role, text))| ChatMessage::new(i, speaker, role, text))
        .collect()
}

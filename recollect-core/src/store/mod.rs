//! Persistent memory state.
//!
//! The host provides a [`KeyValueStore`]; [`MemoryStore`] layers the typed
//! record model on top of it and serializes writes per conversation scope.

mod kv;
mod memory;
mod record;

pub use kv::{merge_json, InMemoryStore, JsonFileStore, KeyValueStore, SharedStore};
pub use memory::{ArchiveAppend, MemoryStore, ARCHIVE_KEY, EPOCH_KEY, MEMORY_KEY};
pub use record::{
    normalize_keyword, normalize_title, ArchiveEntry, ArchiveEntryId, EntityEntry, HistoryEntry,
    MemoryRecord, RecordPatch,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of host state a scope refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// State tied to a single chat.
    Chat,
    /// State shared by every chat with one character.
    Character,
}

impl ScopeKind {
    /// Short name used in keys and file names.
    pub fn name(&self) -> &'static str {
        match self {
            ScopeKind::Chat => "chat",
            ScopeKind::Character => "character",
        }
    }
}

/// Identifies one conversation (or character) memory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId {
    /// Chat or character scope.
    pub kind: ScopeKind,
    /// Host identifier within that kind.
    pub id: String,
}

impl ScopeId {
    /// A chat-scoped id.
    pub fn chat(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Chat,
            id: id.into(),
        }
    }

    /// A character-scoped id.
    pub fn character(id: impl Into<String>) -> Self {
        Self {
            kind: ScopeKind::Character,
            id: id.into(),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.name(), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_display() {
        assert_eq!(ScopeId::chat("abc").to_string(), "chat:abc");
        assert_eq!(ScopeId::character("Alice").to_string(), "character:Alice");
    }

    #[test]
    fn test_scopes_of_different_kinds_differ() {
        assert_ne!(ScopeId::chat("x"), ScopeId::character("x"));
    }
}

//! The memory record model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Everything remembered about one scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Free-text narrative memory, rewritten on each plain consolidation.
    #[serde(default)]
    pub rolling_summary: String,

    /// Structured entities keyed by normalized name.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityEntry>,

    /// Per-message summaries keyed by message index.
    #[serde(default)]
    pub message_summaries: BTreeMap<usize, String>,

    /// Messages before this index have been folded into memory.
    #[serde(default)]
    pub consolidated_cursor: usize,

    /// When memory last changed.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,

    /// Audit trail of past summaries, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,

    /// Message indices already sent to the vector archive.
    #[serde(default)]
    pub archived_indices: BTreeSet<usize>,
}

impl MemoryRecord {
    /// Whether there is nothing worth injecting.
    pub fn is_empty(&self) -> bool {
        self.rolling_summary.trim().is_empty()
            && self.entities.is_empty()
            && self.message_summaries.is_empty()
    }

    /// Look up an entity by title (case-insensitive exact match).
    pub fn entity(&self, title: &str) -> Option<&EntityEntry> {
        self.entities.get(&normalize_title(title))
    }

    /// Merge a parsed entity into memory.
    ///
    /// Existing entities get new content appended and keywords unioned;
    /// unknown titles create a new entity. Returns true if anything changed.
    pub fn merge_entity(&mut self, title: &str, keywords: &[String], content: &str) -> bool {
        let key = normalize_title(title);
        if key.is_empty() {
            return false;
        }

        match self.entities.get_mut(&key) {
            Some(existing) => {
                let added_keywords = existing.add_keywords(keywords);
                let added_content = existing.append_content(content);
                added_keywords || added_content
            }
            None => {
                let mut entry = EntityEntry::new(title.trim(), content);
                entry.add_keywords(keywords);
                self.entities.insert(key, entry);
                true
            }
        }
    }

    /// Append a history entry, evicting the oldest beyond `cap`.
    pub fn push_history(&mut self, entry: HistoryEntry, cap: usize) {
        self.history.push(entry);
        if self.history.len() > cap {
            let excess = self.history.len() - cap;
            self.history.drain(..excess);
        }
    }
}

/// A structured memory entry about one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEntry {
    /// Name as first written by the model.
    pub display_name: String,
    /// Lowercased, deduplicated lookup keywords.
    #[serde(default)]
    pub keywords: BTreeSet<String>,
    /// Accumulated facts.
    pub content: String,
}

impl EntityEntry {
    /// Create an entry with no keywords.
    pub fn new(display_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            keywords: BTreeSet::new(),
            content: content.into().trim().to_string(),
        }
    }

    /// Union keywords in. Returns true if any were new.
    pub fn add_keywords(&mut self, keywords: &[String]) -> bool {
        let mut added = false;
        for keyword in keywords.iter().filter_map(|k| normalize_keyword(k)) {
            added |= self.keywords.insert(keyword);
        }
        added
    }

    /// Append content unless it is already contained. Returns true if appended.
    pub fn append_content(&mut self, content: &str) -> bool {
        let content = content.trim();
        if content.is_empty() || self.content.contains(content) {
            return false;
        }
        if self.content.is_empty() {
            self.content = content.to_string();
        } else {
            self.content.push('\n');
            self.content.push_str(content);
        }
        true
    }

    /// Whether any keyword or the name appears in `text` (case-insensitive).
    pub fn mentioned_in(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        lower.contains(&self.display_name.to_lowercase())
            || self.keywords.iter().any(|k| lower.contains(k.as_str()))
    }
}

/// One entry in the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Memory text as of this entry.
    pub summary: String,
    /// When it was recorded.
    pub timestamp: DateTime<Utc>,
    /// Transcript length the summary covered.
    pub message_count: usize,
}

impl HistoryEntry {
    /// Record `summary` as covering `message_count` messages, now.
    pub fn now(summary: impl Into<String>, message_count: usize) -> Self {
        Self {
            summary: summary.into(),
            timestamp: Utc::now(),
            message_count,
        }
    }
}

/// Partial update to a record; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    /// Replace the rolling summary.
    pub rolling_summary: Option<String>,
    /// Replace the entity map.
    pub entities: Option<BTreeMap<String, EntityEntry>>,
    /// Replace the per-message summaries.
    pub message_summaries: Option<BTreeMap<usize, String>>,
    /// Move the cursor (never backwards).
    pub consolidated_cursor: Option<usize>,
    /// Add archived message indices.
    pub archived_indices: Option<BTreeSet<usize>>,
}

impl RecordPatch {
    /// Whether the patch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.rolling_summary.is_none()
            && self.entities.is_none()
            && self.message_summaries.is_none()
            && self.consolidated_cursor.is_none()
            && self.archived_indices.is_none()
    }

    /// Set the rolling summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.rolling_summary = Some(summary.into());
        self
    }

    /// Set the cursor.
    pub fn with_cursor(mut self, cursor: usize) -> Self {
        self.consolidated_cursor = Some(cursor);
        self
    }

    /// Replace the entities.
    pub fn with_entities(mut self, entities: BTreeMap<String, EntityEntry>) -> Self {
        self.entities = Some(entities);
        self
    }

    /// Replace the per-message summaries.
    pub fn with_message_summaries(mut self, summaries: BTreeMap<usize, String>) -> Self {
        self.message_summaries = Some(summaries);
        self
    }

    /// Mark indices as archived.
    pub fn with_archived(mut self, indices: BTreeSet<usize>) -> Self {
        self.archived_indices = Some(indices);
        self
    }

    /// Merge this patch into `record`. The cursor only moves forward.
    pub fn apply_to(self, record: &mut MemoryRecord) {
        let changes_memory = self.rolling_summary.is_some()
            || self.entities.is_some()
            || self.message_summaries.is_some()
            || self.consolidated_cursor.is_some();

        if let Some(summary) = self.rolling_summary {
            record.rolling_summary = summary;
        }
        if let Some(entities) = self.entities {
            record.entities = entities;
        }
        if let Some(summaries) = self.message_summaries {
            record.message_summaries = summaries;
        }
        if let Some(cursor) = self.consolidated_cursor {
            record.consolidated_cursor = record.consolidated_cursor.max(cursor);
        }
        if let Some(indices) = self.archived_indices {
            record.archived_indices.extend(indices);
        }
        if changes_memory {
            record.last_updated = Some(Utc::now());
        }
    }
}

/// Unique identifier for an archive entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveEntryId(Uuid);

impl ArchiveEntryId {
    /// Create a new random ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ArchiveEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArchiveEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveEntryId({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for ArchiveEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Archived text with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Unique identifier.
    pub id: ArchiveEntryId,
    /// Text, already truncated to the archive limit.
    pub text: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// When it was archived.
    pub timestamp: DateTime<Utc>,
    /// Source message index, when archived from the transcript.
    #[serde(default)]
    pub source_index: Option<usize>,
}

/// Normalize an entity title for lookup.
pub fn normalize_title(title: &str) -> String {
    title.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

/// Normalize a keyword; blank keywords are dropped.
pub fn normalize_keyword(keyword: &str) -> Option<String> {
    let k = keyword.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_lowercase();
    if k.is_empty() {
        None
    } else {
        Some(k)
    }
}

//! Merge prompt construction.

use crate::cleaner::TextCleaner;
use crate::config::{
    MEMORY_PLACEHOLDER, MESSAGE_PLACEHOLDER, NEW_LINES_PLACEHOLDER, WORDS_PLACEHOLDER,
};
use crate::message::ChatMessage;
use crate::store::EntityEntry;
use std::collections::BTreeMap;

/// Shown in place of memory that does not exist yet.
pub const EMPTY_MEMORY: &str = "(nothing yet)";

/// Format messages as `speaker: cleaned text`, one per line. Messages that
/// clean down to nothing are skipped.
pub fn format_new_lines(messages: &[ChatMessage], cleaner: &TextCleaner) -> String {
    messages
        .iter()
        .filter_map(|m| {
            let text = cleaner.clean(&m.text);
            if text.is_empty() {
                None
            } else {
                Some(format!("{}: {}", m.speaker, text))
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render entities as the model is asked to write them.
pub fn render_entities(entities: &BTreeMap<String, EntityEntry>) -> String {
    entities
        .values()
        .map(render_entity)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render one entity as an ENTRY/KEYWORDS/CONTENT block.
pub fn render_entity(entity: &EntityEntry) -> String {
    let keywords = entity.keywords.iter().cloned().collect::<Vec<_>>().join(", ");
    format!(
        "ENTRY: {}\nKEYWORDS: {}\nCONTENT: {}",
        entity.display_name, keywords, entity.content
    )
}

/// Fill a merge template with existing memory and new lines.
pub fn build_merge_prompt(template: &str, memory: &str, new_lines: &str, max_words: usize) -> String {
    let memory = if memory.trim().is_empty() {
        EMPTY_MEMORY
    } else {
        memory
    };
    template
        .replace(MEMORY_PLACEHOLDER, memory)
        .replace(WORDS_PLACEHOLDER, &max_words.to_string())
        .replace(NEW_LINES_PLACEHOLDER, new_lines)
}

/// Fill the per-message template.
pub fn build_message_prompt(template: &str, message: &str, max_words: usize) -> String {
    template
        .replace(WORDS_PLACEHOLDER, &max_words.to_string())
        .replace(MESSAGE_PLACEHOLDER, message)
}

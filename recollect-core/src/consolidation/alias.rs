//! Entity title normalization.

use crate::config::MemoryConfig;
use std::collections::HashSet;

/// Maps a parsed entity title to the title it should be stored under.
pub trait TitleNormalizer: Send + Sync {
    /// Normalize `title`. Returning the input unchanged is always valid.
    fn normalize(&self, title: &str) -> String;
}

/// Collapses self-referential titles ("you", "she", "{{char}}") onto the
/// scope's canonical subject.
#[derive(Debug, Clone, Default)]
pub struct AliasNormalizer {
    subject: Option<String>,
    aliases: HashSet<String>,
}

impl AliasNormalizer {
    /// Map each of `aliases` to `subject`.
    pub fn new(subject: Option<String>, aliases: impl IntoIterator<Item = String>) -> Self {
        Self {
            subject: subject.filter(|s| !s.trim().is_empty()),
            aliases: aliases
                .into_iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .collect(),
        }
    }

    /// Build from the subject and alias list of a config.
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self::new(config.subject_name.clone(), config.subject_aliases.iter().cloned())
    }
}

impl TitleNormalizer for AliasNormalizer {
    fn normalize(&self, title: &str) -> String {
        let trimmed = title.trim();
        match &self.subject {
            Some(subject) if self.aliases.contains(&trimmed.to_lowercase()) => subject.clone(),
            _ => trimmed.to_string(),
        }
    }
}

//! Engine configuration.
//!
//! Every tunable lives in [`MemoryConfig`] and is handed to the service at
//! construction. The struct is serde-friendly so hosts can persist it next
//! to their own settings.

use crate::error::MemoryError;
use crate::generate::GenerationOptions;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Placeholder for the existing memory in merge templates.
pub const MEMORY_PLACEHOLDER: &str = "{{memory}}";

/// Placeholder for the formatted new messages in merge templates.
pub const NEW_LINES_PLACEHOLDER: &str = "{{new_lines}}";

/// Placeholder for a single message in the per-message template.
pub const MESSAGE_PLACEHOLDER: &str = "{{message}}";

/// Placeholder for the word limit.
pub const WORDS_PLACEHOLDER: &str = "{{words}}";

/// Line separating the narrative preamble from entity blocks.
pub const DEFAULT_DELIMITER: &str = "### ENTRIES ###";

/// Response meaning "nothing new worth remembering".
pub const DEFAULT_NO_DATA_SENTINEL: &str = "NO_NEW_DATA";

/// Default plain-mode merge prompt.
pub const DEFAULT_PLAIN_TEMPLATE: &str = "\
You maintain the long-term memory of an ongoing roleplay chat.

Current memory:
{{memory}}

New messages:
{{new_lines}}

Rewrite the memory so it also covers the new messages. Keep names, places, \
promises, injuries and unresolved threads. Drop small talk. Write plain prose \
in past tense, at most {{words}} words. Reply with the updated memory only. \
If the new messages contain nothing worth remembering, reply NO_NEW_DATA.";

/// Default structured-mode extraction prompt.
pub const DEFAULT_STRUCTURED_TEMPLATE: &str = "\
You keep a lorebook for an ongoing roleplay chat.

Known entries:
{{memory}}

New messages:
{{new_lines}}

You may write a short note first. Then write the line ### ENTRIES ### and, \
for every person, place or thing with new facts, a block of exactly:
ENTRY: <name>
KEYWORDS: <comma separated words that should recall it>
CONTENT: <new facts only, one or two sentences>

If there are no new facts, reply NO_NEW_DATA.";

/// Default per-message summary prompt.
pub const DEFAULT_PER_MESSAGE_TEMPLATE: &str = "\
Summarize this roleplay message in one sentence of at most {{words}} words, \
keeping names and concrete events:

{{message}}";

/// How consolidation results are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationShape {
    /// The model rewrites one rolling summary.
    Plain,
    /// The model emits ENTRY/KEYWORDS/CONTENT blocks.
    Structured,
    /// Each message gets its own one-line summary.
    PerMessage,
}

/// Order of the blocks in the injected text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionOrder {
    /// Memory block, then retrieved fragments.
    MemoryFirst,
    /// Retrieved fragments, then memory block.
    RetrievalFirst,
}

/// Where the host should place the injection. Advisory: the engine only
/// reports it alongside the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InjectionPosition {
    /// Before the main prompt.
    BeforePrompt,
    /// After the main prompt.
    AfterPrompt,
    /// Inside the chat, `depth` messages from the end.
    InChat { depth: usize },
}

/// Configuration for the memory engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Pending messages needed before consolidation triggers (>= 1).
    pub threshold: usize,
    /// Active result shape.
    pub shape: ConsolidationShape,
    /// Prompt used in plain mode.
    pub plain_template: String,
    /// Prompt used in structured mode.
    pub structured_template: String,
    /// Prompt used in per-message mode.
    pub per_message_template: String,
    /// Delimiter line preceding entity blocks.
    pub delimiter: String,
    /// Word limit for plain summaries.
    pub max_summary_words: usize,
    /// Character limit for plain summaries (ellipsis added when cut).
    pub max_summary_chars: usize,
    /// History entries kept per scope.
    pub history_cap: usize,
    /// Decoding parameters.
    pub generation: GenerationOptions,
    /// Limit on a single generation call.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Token budget for raw messages kept in context.
    pub token_budget: usize,
    /// Most recent consolidated messages that always stay visible.
    pub continuity_buffer: usize,
    /// Whether excluded messages are archived and retrieved.
    pub archive_enabled: bool,
    /// Number of fragments retrieved.
    pub retrieval_k: usize,
    /// Minimum cosine score for a retrieved fragment.
    pub retrieval_min_score: f32,
    /// Archived text is cut to this many characters.
    pub archive_max_chars: usize,
    /// Header above the memory block.
    pub memory_header: String,
    /// Header above retrieved fragments.
    pub retrieval_header: String,
    /// Order of the injected blocks.
    pub injection_order: InjectionOrder,
    /// Where the host should inject.
    pub injection_position: InjectionPosition,
    /// Token cap for the memory block.
    pub max_injection_tokens: usize,
    /// Canonical subject that pronoun aliases map to.
    pub subject_name: Option<String>,
    /// Titles that mean the subject (case-insensitive).
    pub subject_aliases: Vec<String>,
    /// Response meaning "nothing new".
    pub no_data_sentinel: String,
    /// Label prefixes stripped from responses (case-insensitive).
    pub strip_prefixes: Vec<String>,
    /// Header phrases of noise sections removed from messages.
    pub noise_headers: Vec<String>,
    /// Whether injection text is produced at all.
    pub enabled: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            shape: ConsolidationShape::Plain,
            plain_template: DEFAULT_PLAIN_TEMPLATE.to_string(),
            structured_template: DEFAULT_STRUCTURED_TEMPLATE.to_string(),
            per_message_template: DEFAULT_PER_MESSAGE_TEMPLATE.to_string(),
            delimiter: DEFAULT_DELIMITER.to_string(),
            max_summary_words: 300,
            max_summary_chars: 2000,
            history_cap: 20,
            generation: GenerationOptions::default(),
            timeout: Duration::from_secs(30),
            token_budget: 4096,
            continuity_buffer: 2,
            archive_enabled: false,
            retrieval_k: 3,
            retrieval_min_score: 0.35,
            archive_max_chars: 1000,
            memory_header: "[Memory of earlier events]".to_string(),
            retrieval_header: "[Relevant past fragments]".to_string(),
            injection_order: InjectionOrder::MemoryFirst,
            injection_position: InjectionPosition::AfterPrompt,
            max_injection_tokens: 1024,
            subject_name: None,
            subject_aliases: ["you", "he", "she", "they", "him", "her", "them", "{{char}}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            no_data_sentinel: DEFAULT_NO_DATA_SENTINEL.to_string(),
            strip_prefixes: ["UPDATED MEMORY:", "MEMORY:", "SUMMARY:", "UPDATED SUMMARY:"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            noise_headers: crate::cleaner::DEFAULT_NOISE_HEADERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            enabled: true,
        }
    }
}

impl MemoryConfig {
    /// Default config for a shape. Structured extraction batches more
    /// messages per call than plain rewriting.
    pub fn for_shape(shape: ConsolidationShape) -> Self {
        let threshold = match shape {
            ConsolidationShape::Plain => 5,
            ConsolidationShape::Structured => 10,
            ConsolidationShape::PerMessage => 1,
        };
        Self {
            shape,
            threshold,
            ..Self::default()
        }
    }

    /// Set the trigger threshold.
    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Set the shape.
    pub fn with_shape(mut self, shape: ConsolidationShape) -> Self {
        self.shape = shape;
        self
    }

    /// Set the plain-mode template.
    pub fn with_plain_template(mut self, template: impl Into<String>) -> Self {
        self.plain_template = template.into();
        self
    }

    /// Set the structured-mode template.
    pub fn with_structured_template(mut self, template: impl Into<String>) -> Self {
        self.structured_template = template.into();
        self
    }

    /// Set the generation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the token budget for raw messages.
    pub fn with_token_budget(mut self, budget: usize) -> Self {
        self.token_budget = budget;
        self
    }

    /// Set the continuity buffer.
    pub fn with_continuity_buffer(mut self, buffer: usize) -> Self {
        self.continuity_buffer = buffer;
        self
    }

    /// Enable archiving and retrieval.
    pub fn with_archive(mut self, k: usize, min_score: f32) -> Self {
        self.archive_enabled = true;
        self.retrieval_k = k;
        self.retrieval_min_score = min_score;
        self
    }

    /// Set the canonical subject for alias normalization.
    pub fn with_subject(mut self, name: impl Into<String>) -> Self {
        self.subject_name = Some(name.into());
        self
    }

    /// Set the summary limits.
    pub fn with_summary_limits(mut self, words: usize, chars: usize) -> Self {
        self.max_summary_words = words;
        self.max_summary_chars = chars;
        self
    }

    /// Set the history cap.
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }

    /// Set decoding parameters.
    pub fn with_generation(mut self, options: GenerationOptions) -> Self {
        self.generation = options;
        self
    }

    /// The template for the active shape.
    pub fn active_template(&self) -> &str {
        match self.shape {
            ConsolidationShape::Plain => &self.plain_template,
            ConsolidationShape::Structured => &self.structured_template,
            ConsolidationShape::PerMessage => &self.per_message_template,
        }
    }

    /// Check the configuration for values the engine cannot work with.
    pub fn validate(&self) -> Result<(), MemoryError> {
        if self.threshold == 0 {
            return Err(MemoryError::Config("threshold must be at least 1".to_string()));
        }
        if self.history_cap == 0 {
            return Err(MemoryError::Config("history_cap must be at least 1".to_string()));
        }
        if self.timeout.is_zero() {
            return Err(MemoryError::Config("timeout must be positive".to_string()));
        }

        let template = self.active_template();
        let required: &[&str] = match self.shape {
            ConsolidationShape::Plain | ConsolidationShape::Structured => {
                &[MEMORY_PLACEHOLDER, NEW_LINES_PLACEHOLDER]
            }
            ConsolidationShape::PerMessage => &[MESSAGE_PLACEHOLDER],
        };
        for placeholder in required {
            if !template.contains(placeholder) {
                return Err(MemoryError::Config(format!(
                    "{:?} template is missing {placeholder}",
                    self.shape
                )));
            }
        }

        if self.shape == ConsolidationShape::Structured && self.delimiter.trim().is_empty() {
            return Err(MemoryError::Config("delimiter must not be blank".to_string()));
        }
        if !(-1.0..=1.0).contains(&self.retrieval_min_score) {
            return Err(MemoryError::Config(
                "retrieval_min_score must be within [-1, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        MemoryConfig::default().validate().unwrap();
        for shape in [
            ConsolidationShape::Plain,
            ConsolidationShape::Structured,
            ConsolidationShape::PerMessage,
        ] {
            MemoryConfig::for_shape(shape).validate().unwrap();
        }
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let err = MemoryConfig::default().with_threshold(0).validate().unwrap_err();
        assert!(matches!(err, MemoryError::Config(_)));
    }

    #[test]
    fn test_template_placeholders_required() {
        let config = MemoryConfig::default().with_plain_template("Summarize: {{new_lines}}");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("{{memory}}"));
    }

    #[test]
    fn test_serde_timeout_in_millis() {
        let config = MemoryConfig::default().with_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["timeout"], 1500);

        let parsed: MemoryConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: MemoryConfig =
            serde_json::from_str(r#"{"threshold": 8, "shape": "structured"}"#).unwrap();
        assert_eq!(parsed.threshold, 8);
        assert_eq!(parsed.shape, ConsolidationShape::Structured);
        assert_eq!(parsed.continuity_buffer, 2);
        assert_eq!(parsed.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_injection_position_serde() {
        let json = serde_json::to_string(&InjectionPosition::InChat { depth: 4 }).unwrap();
        assert_eq!(json, r#"{"type":"in_chat","depth":4}"#);
    }
}

//! Folding new messages into memory.
//!
//! [`ConsolidationEngine`] owns the per-scope state machine. The other
//! modules are its pure helpers: prompt assembly, response parsing and title
//! normalization.

mod alias;
mod engine;
mod parser;
mod prompt;

pub use alias::{AliasNormalizer, TitleNormalizer};
pub use engine::{
    ConsolidationEngine, ConsolidationOutcome, ConsolidationReport, EngineState, SkipReason,
};
pub use parser::{
    clip_summary, is_no_data, parse_structured, split_keywords, strip_artifacts, ParsedEntity,
    StructuredParse,
};
pub use prompt::{
    build_merge_prompt, build_message_prompt, format_new_lines, render_entities, render_entity,
    EMPTY_MEMORY,
};

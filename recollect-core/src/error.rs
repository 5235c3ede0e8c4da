//! Error types for the memory engine.
//!
//! Uses thiserror for ergonomic error definition. Every public entry point
//! converts failures into one of these kinds; nothing in this crate panics
//! on bad input from the generation backend or the host store.

use std::time::Duration;

/// Main error type for the memory engine
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// The generation backend failed (network, timeout, non-2xx)
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// Generation succeeded but produced nothing usable
    #[error("Empty result: {reason}")]
    EmptyResult { reason: String },

    /// The response did not match the expected shape
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    /// The persistence layer failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl MemoryError {
    /// Create an empty-result error.
    pub fn empty(reason: impl Into<String>) -> Self {
        Self::EmptyResult {
            reason: reason.into(),
        }
    }

    /// Whether the host should surface this as a non-fatal notification and
    /// simply wait for the next trigger.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MemoryError::Generation(_) | MemoryError::EmptyResult { .. } | MemoryError::Parse(_)
        )
    }
}

/// Errors from the injected generation or embedding function
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    /// Network/connection error
    #[error("Network error: {0}")]
    Network(String),

    /// Backend answered with an error status
    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    /// The call did not finish in time
    #[error("Generation timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// No provider is configured
    #[error("No provider configured: {0}")]
    NotConfigured(String),

    /// Anything else the backend reports
    #[error("{0}")]
    Other(String),
}

/// Parse errors for individual response fragments.
///
/// These are recovered locally: a malformed entity block is discarded and
/// parsing continues with the next one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// An entity block had no usable name
    #[error("Entity block {block} has no name")]
    MissingName { block: usize },

    /// An entity block had no content
    #[error("Entity block {block} ({name}) has no content")]
    MissingContent { block: usize, name: String },

    /// A line appeared outside any entity block
    #[error("Unexpected line {line}: {text}")]
    StrayLine { line: usize, text: String },
}

/// Persistence layer errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored document written by an incompatible version
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Backend-specific failure reported by a host store
    #[error("Backend failure: {0}")]
    Backend(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type for generation and embedding calls
pub type GenerationResult<T> = std::result::Result<T, GenerationError>;

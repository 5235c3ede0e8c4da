//! Token estimation with a pluggable estimator.
//!
//! Retention and injection sizing both measure text through a
//! [`TokenEstimator`]. Hosts with a real tokenizer wrap it in
//! [`FnEstimator`]; everyone else gets the `ceil(chars / 4)` heuristic.

use std::fmt;
use std::sync::Arc;

/// Trait for estimating token counts from text.
///
/// Implementations must be deterministic and monotonic in string length.
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text.
    fn estimate(&self, text: &str) -> usize;

    /// Estimator name for logging.
    fn name(&self) -> &str;
}

/// Character-count based estimator: `ceil(chars / 4)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharHeuristicEstimator;

/// Characters per token assumed by the heuristic.
pub const CHARS_PER_TOKEN: usize = 4;

impl TokenEstimator for CharHeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }

    fn name(&self) -> &str {
        "char_heuristic"
    }
}

/// Adapter for a host-supplied tokenizer function.
#[derive(Clone)]
pub struct FnEstimator {
    name: String,
    count: Arc<dyn Fn(&str) -> usize + Send + Sync>,
}

impl FnEstimator {
    /// Wrap a precise token counting function.
    pub fn new(name: impl Into<String>, count: impl Fn(&str) -> usize + Send + Sync + 'static) -> Self {
        Self {
            name: name.into(),
            count: Arc::new(count),
        }
    }
}

impl fmt::Debug for FnEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnEstimator").field("name", &self.name).finish()
    }
}

impl TokenEstimator for FnEstimator {
    fn estimate(&self, text: &str) -> usize {
        (self.count)(text)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared estimator handle used throughout the engine.
pub type SharedEstimator = Arc<dyn TokenEstimator>;

/// The default estimator.
pub fn default_estimator() -> SharedEstimator {
    Arc::new(CharHeuristicEstimator)
}

//! Builds the text injected into each generation request.
//!
//! Assembly is pure: the same record, fragments and config always give the
//! same text, and nothing is written anywhere.

use crate::archive::ScoredEntry;
use crate::budget::SharedEstimator;
use crate::config::{ConsolidationShape, InjectionOrder, InjectionPosition, MemoryConfig};
use crate::consolidation::render_entity;
use crate::store::{EntityEntry, MemoryRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Injection text and where the host should put it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Injection {
    pub text: String,
    pub position: InjectionPosition,
}

impl Injection {
    /// Whether there is nothing to inject.
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Renders memory and retrieved fragments into header-labelled blocks.
pub struct ContextAssembler {
    estimator: SharedEstimator,
}

impl ContextAssembler {
    /// Create an assembler sizing blocks with `estimator`.
    pub fn new(estimator: SharedEstimator) -> Self {
        Self { estimator }
    }

    /// Build the injection for `record` plus any retrieved fragments.
    ///
    /// `query` is the text about to be answered. When structured memory does
    /// not fit the budget, entities it mentions are kept first.
    pub fn build_injection(
        &self,
        record: &MemoryRecord,
        retrieved: &[ScoredEntry],
        query: Option<&str>,
        config: &MemoryConfig,
    ) -> Injection {
        let mut injection = Injection {
            text: String::new(),
            position: config.injection_position,
        };
        if !config.enabled {
            return injection;
        }

        let memory = self
            .memory_body(record, query, config)
            .map(|body| format!("{}\n{}", config.memory_header, body));
        let fragments = retrieval_body(retrieved)
            .map(|body| format!("{}\n{}", config.retrieval_header, body));

        let blocks = match config.injection_order {
            InjectionOrder::MemoryFirst => [memory, fragments],
            InjectionOrder::RetrievalFirst => [fragments, memory],
        };
        injection.text = blocks.into_iter().flatten().collect::<Vec<_>>().join("\n\n");
        injection
    }

    fn memory_body(
        &self,
        record: &MemoryRecord,
        query: Option<&str>,
        config: &MemoryConfig,
    ) -> Option<String> {
        let budget = config.max_injection_tokens;
        let body = match config.shape {
            ConsolidationShape::Plain => self.clip_words(record.rolling_summary.trim(), budget),
            ConsolidationShape::Structured => {
                // Whole entities until the budget is spent, those the query
                // mentions first. Kept entities are shown in name order.
                let mut candidates: Vec<(&String, &EntityEntry)> = record.entities.iter().collect();
                if let Some(query) = query.filter(|q| !q.trim().is_empty()) {
                    candidates.sort_by_key(|(_, entity)| !entity.mentioned_in(query));
                }
                let mut kept: BTreeMap<&String, String> = BTreeMap::new();
                let mut used = 0;
                for (key, entity) in candidates {
                    let block = render_entity(entity);
                    let cost = self.estimator.estimate(&block);
                    if used + cost > budget {
                        break;
                    }
                    used += cost;
                    kept.insert(key, block);
                }
                kept.into_values().collect::<Vec<_>>().join("\n\n")
            }
            ConsolidationShape::PerMessage => {
                // Newest summaries are kept first, then shown oldest first.
                let mut kept: Vec<&str> = Vec::new();
                let mut used = 0;
                for summary in record.message_summaries.values().rev() {
                    let cost = self.estimator.estimate(summary);
                    if used + cost > budget {
                        break;
                    }
                    used += cost;
                    kept.push(summary);
                }
                kept.reverse();
                kept.join("\n")
            }
        };
        (!body.is_empty()).then_some(body)
    }

    /// Longest word prefix of `text` that fits in `budget` tokens.
    fn clip_words(&self, text: &str, budget: usize) -> String {
        if self.estimator.estimate(text) <= budget {
            return text.to_string();
        }
        let mut clipped = String::new();
        for word in text.split_whitespace() {
            let candidate = if clipped.is_empty() {
                word.to_string()
            } else {
                format!("{clipped} {word}")
            };
            if self.estimator.estimate(&candidate) > budget {
                break;
            }
            clipped = candidate;
        }
        clipped
    }
}

fn retrieval_body(retrieved: &[ScoredEntry]) -> Option<String> {
    let lines: Vec<String> = retrieved
        .iter()
        .map(|s| s.entry.text.trim())
        .filter(|t| !t.is_empty())
        .map(|t| format!("- {t}"))
        .collect();
    (!lines.is_empty()).then(|| lines.join("\n"))
}

//! The consolidation state machine.
//!
//! ```text
//! Idle -> Triggered -> Generating -> Parsing -> Committed | Failed -> Idle
//! ```
//!
//! Each scope has its own state. Leaving `Idle` is a synchronous
//! check-and-set done before the generation call starts, so at most one
//! consolidation per scope is ever in flight; triggers arriving meanwhile are
//! dropped, not queued. The next natural trigger sees an up-to-date pending
//! count.
//!
//! A run reads the scope's wipe epoch before the record it builds on. If the
//! scope is wiped while the run is generating, the commit is dropped.

use super::alias::{AliasNormalizer, TitleNormalizer};
use super::parser::{clip_summary, is_no_data, parse_structured, strip_artifacts};
use super::prompt::{build_merge_prompt, build_message_prompt, format_new_lines, render_entities};
use crate::cleaner::TextCleaner;
use crate::config::{ConsolidationShape, MemoryConfig};
use crate::error::{GenerationError, MemoryError, ParseError, Result};
use crate::events::{EventBus, MemoryEvent};
use crate::generate::SharedGenerator;
use crate::message::ChatMessage;
use crate::store::{HistoryEntry, MemoryRecord, MemoryStore, RecordPatch, ScopeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Where a scope is in the consolidation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Triggered,
    Generating,
    Parsing,
    Committed,
    Failed,
}

impl EngineState {
    /// Whether a new trigger may start a consolidation.
    pub fn is_idle(&self) -> bool {
        matches!(self, EngineState::Idle)
    }
}

/// Why a trigger did not start a consolidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Fewer pending messages than the threshold.
    BelowThreshold { pending: usize, threshold: usize },
    /// Another consolidation for the scope is in flight.
    InFlight,
    /// Every message is already consolidated.
    NothingPending,
    /// The scope was wiped while the run was in flight; its result was
    /// dropped.
    Wiped,
}

/// Result of a trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsolidationOutcome {
    /// No consolidation ran.
    Skipped(SkipReason),
    /// Memory was rewritten.
    Committed(ConsolidationReport),
    /// The messages held nothing new; only the cursor moved.
    NoNewData { cursor: usize },
}

impl ConsolidationOutcome {
    /// Whether memory text changed.
    pub fn is_committed(&self) -> bool {
        matches!(self, ConsolidationOutcome::Committed(_))
    }

    /// Whether the trigger was dropped.
    pub fn is_skipped(&self) -> bool {
        matches!(self, ConsolidationOutcome::Skipped(_))
    }
}

/// Summary of a committed consolidation.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidationReport {
    /// Shape that produced the result.
    pub shape: ConsolidationShape,
    /// Cursor after the commit.
    pub cursor: usize,
    /// Number of messages folded in.
    pub consolidated: usize,
    /// Titles of entities created or extended (structured shape).
    pub entities_touched: Vec<String>,
    /// Entity blocks discarded as malformed (structured shape).
    pub discarded_blocks: usize,
}

type StateTable = Arc<Mutex<HashMap<ScopeId, EngineState>>>;

/// Marks a scope busy for as long as it lives. Dropping it, on any path,
/// returns the scope to `Idle`.
struct InFlight {
    states: StateTable,
    scope: ScopeId,
}

impl InFlight {
    fn try_begin(states: &StateTable, scope: &ScopeId) -> Option<Self> {
        let mut table = states.lock();
        if table.get(scope).is_some_and(|s| !s.is_idle()) {
            return None;
        }
        table.insert(scope.clone(), EngineState::Triggered);
        Some(Self {
            states: states.clone(),
            scope: scope.clone(),
        })
    }

    fn set(&self, state: EngineState) {
        self.states.lock().insert(self.scope.clone(), state);
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.states.lock().remove(&self.scope);
    }
}

/// What a successful generation pass wants written.
enum Pass {
    Commit(ConsolidationReport),
    NoNewData,
    Wiped,
}

/// Folds new messages into memory through the injected generator.
pub struct ConsolidationEngine {
    generator: SharedGenerator,
    store: Arc<MemoryStore>,
    normalizer: Option<Arc<dyn TitleNormalizer>>,
    states: StateTable,
    events: EventBus,
}

impl ConsolidationEngine {
    /// Create an engine writing to `store`.
    pub fn new(generator: SharedGenerator, store: Arc<MemoryStore>, events: EventBus) -> Self {
        Self {
            generator,
            store,
            normalizer: None,
            states: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Use a custom title normalizer instead of the configured alias list.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn TitleNormalizer>) -> Self {
        self.normalizer = Some(normalizer);
        self
    }

    /// Current state of a scope.
    pub fn state(&self, scope: &ScopeId) -> EngineState {
        self.states
            .lock()
            .get(scope)
            .copied()
            .unwrap_or(EngineState::Idle)
    }

    /// Run the trigger check for a scope after a message was appended.
    pub async fn on_new_message(
        &self,
        scope: &ScopeId,
        messages: &[ChatMessage],
        config: &MemoryConfig,
    ) -> Result<ConsolidationOutcome> {
        let record = self.store.get(scope).await?;
        let pending = messages.len().saturating_sub(record.consolidated_cursor);
        if pending < config.threshold {
            return Ok(ConsolidationOutcome::Skipped(SkipReason::BelowThreshold {
                pending,
                threshold: config.threshold,
            }));
        }
        self.run(scope, messages, config, Some(config.threshold)).await
    }

    /// Consolidate whatever is pending, ignoring the threshold. Still
    /// respects the in-flight guard.
    pub async fn force_consolidate(
        &self,
        scope: &ScopeId,
        messages: &[ChatMessage],
        config: &MemoryConfig,
    ) -> Result<ConsolidationOutcome> {
        self.run(scope, messages, config, None).await
    }

    async fn run(
        &self,
        scope: &ScopeId,
        messages: &[ChatMessage],
        config: &MemoryConfig,
        threshold: Option<usize>,
    ) -> Result<ConsolidationOutcome> {
        let Some(guard) = InFlight::try_begin(&self.states, scope) else {
            debug!(scope = %scope, "Consolidation already in flight, trigger dropped");
            return Ok(ConsolidationOutcome::Skipped(SkipReason::InFlight));
        };

        // Another run may have committed between the caller's read and the
        // check-and-set above. The epoch is read first: a wipe landing
        // between the two reads still fences this run.
        let epoch = self.store.epoch(scope).await?;
        let record = self.store.get(scope).await?;
        let snapshot_len = messages.len();
        let cursor = record.consolidated_cursor.min(snapshot_len);
        let pending = snapshot_len - cursor;
        if pending == 0 {
            return Ok(ConsolidationOutcome::Skipped(SkipReason::NothingPending));
        }
        if let Some(threshold) = threshold.filter(|t| pending < *t) {
            return Ok(ConsolidationOutcome::Skipped(SkipReason::BelowThreshold {
                pending,
                threshold,
            }));
        }

        info!(scope = %scope, pending, cursor, shape = ?config.shape, "Consolidation triggered");
        self.events.publish(MemoryEvent::ConsolidationStarted {
            scope: scope.clone(),
            pending,
            shape: config.shape,
        });

        let new_messages = &messages[cursor..snapshot_len];
        let result = match config.shape {
            ConsolidationShape::Plain => {
                self.plain(&guard, scope, &record, new_messages, (snapshot_len, epoch), config)
                    .await
            }
            ConsolidationShape::Structured => {
                self.structured(&guard, scope, &record, new_messages, (snapshot_len, epoch), config)
                    .await
            }
            ConsolidationShape::PerMessage => {
                self.per_message(&guard, scope, new_messages, (snapshot_len, epoch), config)
                    .await
            }
        };

        match result {
            Ok(Pass::Commit(report)) => {
                guard.set(EngineState::Committed);
                info!(
                    scope = %scope,
                    cursor = report.cursor,
                    entities = report.entities_touched.len(),
                    "Consolidation committed"
                );
                self.events.publish(MemoryEvent::MemoryUpdated {
                    scope: scope.clone(),
                    cursor: report.cursor,
                });
                Ok(ConsolidationOutcome::Committed(report))
            }
            Ok(Pass::NoNewData) => {
                let written = self
                    .store
                    .modify_in_epoch(scope, epoch, |r| {
                        RecordPatch::default().with_cursor(snapshot_len).apply_to(r)
                    })
                    .await?;
                let Some(record) = written else {
                    return Ok(self.dropped_after_wipe(scope));
                };
                guard.set(EngineState::Committed);
                info!(scope = %scope, cursor = record.consolidated_cursor, "Nothing new to remember");
                Ok(ConsolidationOutcome::NoNewData {
                    cursor: record.consolidated_cursor,
                })
            }
            Ok(Pass::Wiped) => Ok(self.dropped_after_wipe(scope)),
            Err(e) => {
                guard.set(EngineState::Failed);
                warn!(scope = %scope, error = %e, "Consolidation failed, memory unchanged");
                self.events.publish(MemoryEvent::ConsolidationFailed {
                    scope: scope.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn plain(
        &self,
        guard: &InFlight,
        scope: &ScopeId,
        record: &MemoryRecord,
        new_messages: &[ChatMessage],
        (snapshot_len, epoch): (usize, u64),
        config: &MemoryConfig,
    ) -> Result<Pass> {
        let new_lines = format_new_lines(new_messages, &cleaner_for(config));
        if new_lines.is_empty() {
            return Ok(Pass::NoNewData);
        }

        let prompt = build_merge_prompt(
            &config.plain_template,
            &record.rolling_summary,
            &new_lines,
            config.max_summary_words,
        );
        let raw = self.generate(guard, &prompt, config).await?;

        guard.set(EngineState::Parsing);
        let text = strip_artifacts(&raw, &config.strip_prefixes);
        if text.is_empty() {
            return Err(MemoryError::empty("generation returned no text"));
        }
        if is_no_data(&text, &config.no_data_sentinel) {
            return Ok(Pass::NoNewData);
        }

        let summary = clip_summary(&text, config.max_summary_words, config.max_summary_chars);
        let history = HistoryEntry::now(summary.clone(), snapshot_len);
        let cap = config.history_cap;
        let patch = RecordPatch::default()
            .with_summary(summary)
            .with_cursor(snapshot_len);
        let Some(record) = self
            .store
            .modify_in_epoch(scope, epoch, move |r| {
                patch.apply_to(r);
                r.push_history(history, cap);
            })
            .await?
        else {
            return Ok(Pass::Wiped);
        };

        Ok(Pass::Commit(ConsolidationReport {
            shape: ConsolidationShape::Plain,
            cursor: record.consolidated_cursor,
            consolidated: new_messages.len(),
            entities_touched: Vec::new(),
            discarded_blocks: 0,
        }))
    }

    async fn structured(
        &self,
        guard: &InFlight,
        scope: &ScopeId,
        record: &MemoryRecord,
        new_messages: &[ChatMessage],
        (snapshot_len, epoch): (usize, u64),
        config: &MemoryConfig,
    ) -> Result<Pass> {
        let new_lines = format_new_lines(new_messages, &cleaner_for(config));
        if new_lines.is_empty() {
            return Ok(Pass::NoNewData);
        }

        let prompt = build_merge_prompt(
            &config.structured_template,
            &render_entities(&record.entities),
            &new_lines,
            config.max_summary_words,
        );
        let raw = self.generate(guard, &prompt, config).await?;

        guard.set(EngineState::Parsing);
        let text = strip_artifacts(&raw, &config.strip_prefixes);
        if text.is_empty() {
            return Err(MemoryError::empty("generation returned no text"));
        }
        if is_no_data(&text, &config.no_data_sentinel) {
            return Ok(Pass::NoNewData);
        }

        let parsed = parse_structured(&text, &config.delimiter);
        if let Some(preamble) = &parsed.preamble {
            debug!(scope = %scope, preamble = %preamble, "Narrative note before entries");
        }
        for error in &parsed.errors {
            debug!(scope = %scope, error = %error, "Discarded response fragment");
        }
        if parsed.entities.is_empty() {
            return Err(MemoryError::empty(format!(
                "no usable entity blocks ({} discarded)",
                parsed.errors.len()
            )));
        }

        let normalizer: Arc<dyn TitleNormalizer> = match &self.normalizer {
            Some(custom) => custom.clone(),
            None => Arc::new(AliasNormalizer::from_config(config)),
        };
        let entities: Vec<_> = parsed
            .entities
            .into_iter()
            .map(|e| (normalizer.normalize(&e.name), e.keywords, e.content))
            .collect();
        let discarded_blocks = parsed
            .errors
            .iter()
            .filter(|e| !matches!(e, ParseError::StrayLine { .. }))
            .count();

        let cap = config.history_cap;
        let mut touched = Vec::new();
        let Some(record) = self
            .store
            .modify_in_epoch(scope, epoch, |r| {
                for (title, keywords, content) in &entities {
                    if r.merge_entity(title, keywords, content) {
                        touched.push(title.clone());
                    }
                }
                RecordPatch::default()
                    .with_cursor(snapshot_len)
                    .apply_to(r);
                let snapshot = render_entities(&r.entities);
                r.push_history(HistoryEntry::now(snapshot, snapshot_len), cap);
            })
            .await?
        else {
            return Ok(Pass::Wiped);
        };

        Ok(Pass::Commit(ConsolidationReport {
            shape: ConsolidationShape::Structured,
            cursor: record.consolidated_cursor,
            consolidated: new_messages.len(),
            entities_touched: touched,
            discarded_blocks,
        }))
    }

    async fn per_message(
        &self,
        guard: &InFlight,
        scope: &ScopeId,
        new_messages: &[ChatMessage],
        (snapshot_len, epoch): (usize, u64),
        config: &MemoryConfig,
    ) -> Result<Pass> {
        let cleaner = cleaner_for(config);
        let mut summaries = BTreeMap::new();

        for message in new_messages {
            let cleaned = cleaner.clean(&message.text);
            if cleaned.is_empty() {
                continue;
            }
            let prompt = build_message_prompt(
                &config.per_message_template,
                &format!("{}: {}", message.speaker, cleaned),
                config.max_summary_words,
            );
            let raw = self.generate(guard, &prompt, config).await?;

            guard.set(EngineState::Parsing);
            let text = strip_artifacts(&raw, &config.strip_prefixes);
            if text.is_empty() {
                return Err(MemoryError::empty(format!(
                    "no summary for message {}",
                    message.index
                )));
            }
            if is_no_data(&text, &config.no_data_sentinel) {
                continue;
            }
            summaries.insert(
                message.index,
                clip_summary(&text, config.max_summary_words, config.max_summary_chars),
            );
        }

        if summaries.is_empty() {
            return Ok(Pass::NoNewData);
        }

        let cap = config.history_cap;
        let history = HistoryEntry::now(
            summaries.values().cloned().collect::<Vec<_>>().join("\n"),
            snapshot_len,
        );
        let Some(record) = self
            .store
            .modify_in_epoch(scope, epoch, move |r| {
                let mut merged = r.message_summaries.clone();
                merged.extend(summaries);
                RecordPatch::default()
                    .with_message_summaries(merged)
                    .with_cursor(snapshot_len)
                    .apply_to(r);
                r.push_history(history, cap);
            })
            .await?
        else {
            return Ok(Pass::Wiped);
        };

        Ok(Pass::Commit(ConsolidationReport {
            shape: ConsolidationShape::PerMessage,
            cursor: record.consolidated_cursor,
            consolidated: new_messages.len(),
            entities_touched: Vec::new(),
            discarded_blocks: 0,
        }))
    }

    fn dropped_after_wipe(&self, scope: &ScopeId) -> ConsolidationOutcome {
        info!(scope = %scope, "Scope wiped during consolidation, result dropped");
        ConsolidationOutcome::Skipped(SkipReason::Wiped)
    }

    /// One generation call under the configured timeout.
    async fn generate(&self, guard: &InFlight, prompt: &str, config: &MemoryConfig) -> Result<String> {
        guard.set(EngineState::Generating);
        debug!(
            generator = self.generator.name(),
            prompt_chars = prompt.len(),
            "Calling generator"
        );
        let call = self.generator.generate(prompt, &config.generation);
        match tokio::time::timeout(config.timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(GenerationError::Timeout {
                duration: config.timeout,
            }
            .into()),
        }
    }
}

fn cleaner_for(config: &MemoryConfig) -> TextCleaner {
    TextCleaner::new(config.noise_headers.iter().cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{transcript, Role};
    use crate::store::InMemoryStore;
    use crate::testing::MockGenerator;

    fn engine(generator: Arc<MockGenerator>) -> (ConsolidationEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new(Arc::new(InMemoryStore::new())));
        let engine = ConsolidationEngine::new(generator, store.clone(), EventBus::new());
        (engine, store)
    }

    fn chat(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Character };
                ChatMessage::new(i, if i % 2 == 0 { "Ann" } else { "Bot" }, role, format!("line {i}"))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_below_threshold_skips() {
        let generator = Arc::new(MockGenerator::new());
        let (engine, _) = engine(generator.clone());
        let outcome = engine
            .on_new_message(&ScopeId::chat("c"), &chat(3), &MemoryConfig::default())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ConsolidationOutcome::Skipped(SkipReason::BelowThreshold {
                pending: 3,
                threshold: 5
            })
        );
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_plain_commit_clips_and_records_history() {
        let generator = Arc::new(MockGenerator::new().respond("UPDATED MEMORY: one two three four"));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::default().with_summary_limits(3, 100);

        let outcome = engine.on_new_message(&scope, &chat(5), &config).await.unwrap();
        assert!(outcome.is_committed());

        let record = store.get(&scope).await.unwrap();
        assert_eq!(record.rolling_summary, "one two three…");
        assert_eq!(record.consolidated_cursor, 5);
        assert_eq!(record.history.len(), 1);
        assert_eq!(record.history[0].message_count, 5);
        assert_eq!(engine.state(&scope), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_prompt_contains_memory_and_new_lines() {
        let generator = Arc::new(MockGenerator::new().respond("second"));
        let (engine, store) = engine(generator.clone());
        let scope = ScopeId::chat("c");
        store
            .update(&scope, RecordPatch::default().with_summary("first").with_cursor(2))
            .await
            .unwrap();

        let config = MemoryConfig::default().with_threshold(1);
        engine.on_new_message(&scope, &chat(3), &config).await.unwrap();

        let prompt = generator.prompts().pop().unwrap();
        assert!(prompt.contains("first"));
        assert!(prompt.contains("Ann: line 2"));
        assert!(!prompt.contains("line 1"));
    }

    #[tokio::test]
    async fn test_no_data_advances_cursor_only() {
        let generator = Arc::new(MockGenerator::new().respond("NO_NEW_DATA"));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");

        let outcome = engine
            .on_new_message(&scope, &chat(5), &MemoryConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, ConsolidationOutcome::NoNewData { cursor: 5 });

        let record = store.get(&scope).await.unwrap();
        assert_eq!(record.rolling_summary, "");
        assert!(record.history.is_empty());
    }

    #[tokio::test]
    async fn test_empty_response_fails_without_commit() {
        let generator = Arc::new(MockGenerator::new().respond("  \"\"  "));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");

        let err = engine
            .on_new_message(&scope, &chat(5), &MemoryConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::EmptyResult { .. }));
        assert_eq!(store.get(&scope).await.unwrap(), MemoryRecord::default());
        assert_eq!(engine.state(&scope), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_structured_merge_and_alias() {
        let generator = Arc::new(MockGenerator::new().respond(
            "They talked.\n### ENTRIES ###\nENTRY: you\nKEYWORDS: healer\nCONTENT: Tends the wounded.\n\
             ENTRY:\nCONTENT: junk",
        ));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::for_shape(ConsolidationShape::Structured)
            .with_threshold(2)
            .with_subject("Seraphina");

        let outcome = engine.on_new_message(&scope, &chat(2), &config).await.unwrap();
        let ConsolidationOutcome::Committed(report) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(report.entities_touched, vec!["Seraphina".to_string()]);
        assert_eq!(report.discarded_blocks, 1);

        let record = store.get(&scope).await.unwrap();
        let entity = record.entity("seraphina").unwrap();
        assert_eq!(entity.content, "Tends the wounded.");
        assert!(entity.keywords.contains("healer"));
        assert_eq!(record.consolidated_cursor, 2);
    }

    #[tokio::test]
    async fn test_structured_trailing_chatter_not_stored() {
        let generator = Arc::new(MockGenerator::new().respond(
            "ENTRY: Dan\nKEYWORDS: guard\nCONTENT: a guard\n\nHope this helps! Let me know.",
        ));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::for_shape(ConsolidationShape::Structured).with_threshold(1);

        let outcome = engine.on_new_message(&scope, &chat(1), &config).await.unwrap();
        let ConsolidationOutcome::Committed(report) = outcome else {
            panic!("expected commit, got {outcome:?}");
        };
        assert_eq!(report.discarded_blocks, 0);
        assert_eq!(store.get(&scope).await.unwrap().entity("dan").unwrap().content, "a guard");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wipe_mid_flight_drops_result() {
        let generator = Arc::new(MockGenerator::new().respond("Old memory plus new.").gated());
        let (engine, store) = engine(generator.clone());
        let engine = Arc::new(engine);
        let scope = ScopeId::chat("c");
        store
            .update(&scope, RecordPatch::default().with_summary("Old memory"))
            .await
            .unwrap();

        let task = {
            let (engine, scope) = (engine.clone(), scope.clone());
            tokio::spawn(async move {
                engine
                    .on_new_message(&scope, &chat(5), &MemoryConfig::default())
                    .await
            })
        };
        generator.wait_for_calls(1).await;
        store.wipe(&scope).await.unwrap();
        generator.release(1);

        assert_eq!(
            task.await.unwrap().unwrap(),
            ConsolidationOutcome::Skipped(SkipReason::Wiped)
        );
        assert_eq!(store.get(&scope).await.unwrap(), MemoryRecord::default());
        assert_eq!(engine.state(&scope), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_structured_without_blocks_is_empty_result() {
        let generator = Arc::new(MockGenerator::new().respond("I could not find anything."));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::for_shape(ConsolidationShape::Structured).with_threshold(1);

        let err = engine.on_new_message(&scope, &chat(1), &config).await.unwrap_err();
        assert!(matches!(err, MemoryError::EmptyResult { .. }));
        assert_eq!(store.get(&scope).await.unwrap().consolidated_cursor, 0);
    }

    #[tokio::test]
    async fn test_per_message_is_all_or_nothing() {
        let generator = Arc::new(
            MockGenerator::new()
                .respond("Ann waved.")
                .fail(GenerationError::Network("reset".to_string())),
        );
        let (engine, store) = engine(generator.clone());
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::for_shape(ConsolidationShape::PerMessage);

        assert!(engine.force_consolidate(&scope, &chat(2), &config).await.is_err());
        assert_eq!(generator.calls(), 2);
        assert_eq!(store.get(&scope).await.unwrap(), MemoryRecord::default());
    }

    #[tokio::test]
    async fn test_per_message_summaries_keyed_by_index() {
        let generator = Arc::new(MockGenerator::new().respond("Ann waved.").respond("Bot bowed."));
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::for_shape(ConsolidationShape::PerMessage);
        let messages = transcript([
            ("Ann", Role::User, "*waves*"),
            ("Bot", Role::Character, "*bows*"),
        ]);

        engine.force_consolidate(&scope, &messages, &config).await.unwrap();

        let record = store.get(&scope).await.unwrap();
        assert_eq!(record.message_summaries.get(&0).unwrap(), "Ann waved.");
        assert_eq!(record.message_summaries.get(&1).unwrap(), "Bot bowed.");
        assert_eq!(record.consolidated_cursor, 2);
    }

    #[tokio::test]
    async fn test_force_with_nothing_pending() {
        let generator = Arc::new(MockGenerator::new());
        let (engine, _) = engine(generator.clone());
        let outcome = engine
            .force_consolidate(&ScopeId::chat("c"), &[], &MemoryConfig::default())
            .await
            .unwrap();
        assert_eq!(outcome, ConsolidationOutcome::Skipped(SkipReason::NothingPending));
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_generation_error() {
        let generator = Arc::new(MockGenerator::new().hang());
        let (engine, store) = engine(generator);
        let scope = ScopeId::chat("c");
        let config = MemoryConfig::default().with_timeout(std::time::Duration::from_secs(30));

        let err = engine.on_new_message(&scope, &chat(5), &config).await.unwrap_err();
        assert!(matches!(
            err,
            MemoryError::Generation(GenerationError::Timeout { .. })
        ));
        assert_eq!(store.get(&scope).await.unwrap().consolidated_cursor, 0);
        assert_eq!(engine.state(&scope), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_failure_publishes_event() {
        let generator = Arc::new(MockGenerator::new().fail(GenerationError::Backend {
            status: 503,
            message: "busy".to_string(),
        }));
        let store = Arc::new(MemoryStore::new(Arc::new(InMemoryStore::new())));
        let events = EventBus::new();
        let mut receiver = events.subscribe();
        let engine = ConsolidationEngine::new(generator, store, events);

        let _ = engine
            .on_new_message(&ScopeId::chat("c"), &chat(5), &MemoryConfig::default())
            .await;

        assert!(matches!(
            receiver.recv().await.unwrap(),
            MemoryEvent::ConsolidationStarted { pending: 5, .. }
        ));
        assert!(matches!(
            receiver.recv().await.unwrap(),
            MemoryEvent::ConsolidationFailed { .. }
        ));
    }
}

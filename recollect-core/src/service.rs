//! MemoryService - the host-facing API.
//!
//! Wraps the consolidation engine, retention, assembly, archive and store
//! behind the handful of calls a chat host makes:
//! - [`MemoryService::on_new_message`] after every appended message
//! - [`MemoryService::get_injection_text`] before every generation request
//! - [`MemoryService::get_memory_snapshot`], [`MemoryService::force_consolidate`]
//!   and [`MemoryService::wipe`] from the memory UI

use crate::archive::VectorArchive;
use crate::assembler::{ContextAssembler, Injection};
use crate::budget::{default_estimator, SharedEstimator};
use crate::cleaner::TextCleaner;
use crate::config::MemoryConfig;
use crate::consolidation::{ConsolidationEngine, ConsolidationOutcome, EngineState, TitleNormalizer};
use crate::error::Result;
use crate::events::{EventBus, MemoryEvent};
use crate::generate::{NoEmbedder, SharedEmbedder, SharedGenerator};
use crate::message::ChatMessage;
use crate::retention::{RetentionController, RetentionReport};
use crate::store::{HistoryEntry, MemoryRecord, MemoryStore, RecordPatch, ScopeId, SharedStore};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Memory consolidation and context budgeting for one host.
///
/// Cheap to share behind an `Arc`; every method takes `&self` and scopes
/// never block each other.
pub struct MemoryService {
    config: RwLock<Arc<MemoryConfig>>,
    store: Arc<MemoryStore>,
    engine: ConsolidationEngine,
    archive: VectorArchive,
    retention: RetentionController,
    assembler: ContextAssembler,
    events: EventBus,
}

impl MemoryService {
    /// Create a service. Fails if `config` does not validate.
    pub fn new(config: MemoryConfig, generator: SharedGenerator, kv: SharedStore) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(MemoryStore::new(kv).with_history_cap(config.history_cap));
        let events = EventBus::new();
        let estimator = default_estimator();
        let archive = VectorArchive::new(Arc::new(NoEmbedder), store.clone())
            .with_max_chars(config.archive_max_chars);

        Ok(Self {
            engine: ConsolidationEngine::new(generator, store.clone(), events.clone()),
            retention: RetentionController::new(estimator.clone()),
            assembler: ContextAssembler::new(estimator),
            config: RwLock::new(Arc::new(config)),
            store,
            archive,
            events,
        })
    }

    /// Use `embedder` for the archive.
    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.archive = VectorArchive::new(embedder, self.store.clone())
            .with_max_chars(self.config().archive_max_chars);
        self
    }

    /// Use a precise token estimator.
    pub fn with_estimator(mut self, estimator: SharedEstimator) -> Self {
        self.retention = RetentionController::new(estimator.clone());
        self.assembler = ContextAssembler::new(estimator);
        self
    }

    /// Use a custom entity title normalizer.
    pub fn with_normalizer(mut self, normalizer: Arc<dyn TitleNormalizer>) -> Self {
        self.engine = self.engine.with_normalizer(normalizer);
        self
    }

    /// Current configuration.
    pub fn config(&self) -> Arc<MemoryConfig> {
        self.config.read().clone()
    }

    /// Replace the configuration. Runs already in flight keep the config
    /// they started with.
    pub fn set_config(&self, config: MemoryConfig) -> Result<()> {
        config.validate()?;
        self.archive.set_max_chars(config.archive_max_chars);
        *self.config.write() = Arc::new(config);
        Ok(())
    }

    /// Subscribe to memory events.
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryEvent> {
        self.events.subscribe()
    }

    /// The typed store.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// The archive.
    pub fn archive(&self) -> &VectorArchive {
        &self.archive
    }

    /// Consolidation state of a scope.
    pub fn engine_state(&self, scope: &ScopeId) -> EngineState {
        self.engine.state(scope)
    }

    /// Hook called after every appended message; consolidates once enough
    /// messages are pending.
    pub async fn on_new_message(
        &self,
        scope: &ScopeId,
        messages: &[ChatMessage],
    ) -> Result<ConsolidationOutcome> {
        let config = self.config();
        self.engine.on_new_message(scope, messages, &config).await
    }

    /// Consolidate now, regardless of the threshold.
    pub async fn force_consolidate(
        &self,
        scope: &ScopeId,
        messages: &[ChatMessage],
    ) -> Result<ConsolidationOutcome> {
        let config = self.config();
        self.engine.force_consolidate(scope, messages, &config).await
    }

    /// Read-only copy of a scope's memory.
    pub async fn get_memory_snapshot(&self, scope: &ScopeId) -> Result<MemoryRecord> {
        Ok(self.store.get(scope).await?)
    }

    /// Forget everything about a scope: record, history and archive.
    pub async fn wipe(&self, scope: &ScopeId) -> Result<()> {
        self.store.wipe(scope).await?;
        info!(scope = %scope, "Memory wiped");
        self.events.publish(MemoryEvent::Wiped {
            scope: scope.clone(),
        });
        Ok(())
    }

    /// Injection for the next generation request, with its position.
    ///
    /// Archive fragments are retrieved only when a query is given and the
    /// archive is enabled.
    pub async fn get_injection(&self, scope: &ScopeId, query: Option<&str>) -> Result<Injection> {
        let config = self.config();
        if !config.enabled {
            return Ok(self
                .assembler
                .build_injection(&MemoryRecord::default(), &[], None, &config));
        }

        let record = self.store.get(scope).await?;
        let retrieved = match query {
            Some(query) if config.archive_enabled => {
                self.archive
                    .retrieve(scope, query, config.retrieval_k, config.retrieval_min_score)
                    .await?
            }
            _ => Vec::new(),
        };
        Ok(self
            .assembler
            .build_injection(&record, &retrieved, query, &config))
    }

    /// Injection text for the next generation request.
    pub async fn get_injection_text(&self, scope: &ScopeId, query: Option<&str>) -> Result<String> {
        Ok(self.get_injection(scope, query).await?.text)
    }

    /// Flag messages that no longer fit the token budget, archiving newly
    /// excluded ones when the archive is enabled.
    pub async fn apply_retention(
        &self,
        scope: &ScopeId,
        messages: &mut [ChatMessage],
    ) -> Result<RetentionReport> {
        let config = self.config();
        let record = self.store.get(scope).await?;
        let cleaner = TextCleaner::new(config.noise_headers.iter().cloned());
        let archive = config
            .archive_enabled
            .then_some((&self.archive, &cleaner));

        let report = self
            .retention
            .apply(
                scope,
                messages,
                &record,
                config.token_budget,
                config.continuity_buffer,
                archive,
            )
            .await?;

        if report.archived > 0 {
            self.events.publish(MemoryEvent::MessagesArchived {
                scope: scope.clone(),
                count: report.archived,
            });
        }
        Ok(report)
    }

    /// Overwrite the rolling summary by hand. The edit is recorded in
    /// history; the cursor does not move.
    pub async fn set_rolling_summary(&self, scope: &ScopeId, summary: &str) -> Result<MemoryRecord> {
        let summary = summary.trim().to_string();
        let cap = self.config().history_cap;
        let record = self
            .store
            .modify(scope, move |r| {
                let history = HistoryEntry::now(summary.clone(), r.consolidated_cursor);
                RecordPatch::default().with_summary(summary).apply_to(r);
                r.push_history(history, cap);
            })
            .await?;

        self.events.publish(MemoryEvent::MemoryUpdated {
            scope: scope.clone(),
            cursor: record.consolidated_cursor,
        });
        Ok(record)
    }
}

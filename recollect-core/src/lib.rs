//! Rolling conversation memory for LLM chat hosts.
//!
//! This crate provides:
//! - Threshold-triggered consolidation of new messages into a rolling
//!   summary, structured entities or per-message summaries
//! - Token-budgeted retention that flags old messages out of context
//! - Injection text assembly from memory and archive retrieval
//! - An embedding archive of pruned messages
//!
//! The host supplies the generator, optional embedder and key-value store.
//!
//! # Quick Start
//!
//! ```ignore
//! use recollect_core::{InMemoryStore, MemoryConfig, MemoryService, ScopeId};
//! use std::sync::Arc;
//!
//! let service = MemoryService::new(MemoryConfig::default(), my_generator, Arc::new(InMemoryStore::new()))?;
//! let scope = ScopeId::chat("chat-42");
//!
//! // After every appended message:
//! service.on_new_message(&scope, &messages).await?;
//!
//! // Before every generation request:
//! let memory = service.get_injection_text(&scope, Some(latest_user_text)).await?;
//! ```

pub mod archive;
pub mod assembler;
pub mod budget;
pub mod cleaner;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod events;
pub mod generate;
pub mod message;
pub mod retention;
pub mod service;
pub mod store;
pub mod testing;

// Primary public API
pub use archive::{ArchiveItem, ScoredEntry, VectorArchive};
pub use assembler::{ContextAssembler, Injection};
pub use budget::{CharHeuristicEstimator, FnEstimator, SharedEstimator, TokenEstimator};
pub use cleaner::TextCleaner;
pub use config::{ConsolidationShape, InjectionOrder, InjectionPosition, MemoryConfig};
pub use consolidation::{
    AliasNormalizer, ConsolidationEngine, ConsolidationOutcome, ConsolidationReport, EngineState,
    SkipReason, TitleNormalizer,
};
pub use error::{GenerationError, MemoryError, ParseError, Result, StoreError};
pub use events::{EventBus, MemoryEvent};
pub use generate::{Embedder, GenerationOptions, Generator, SharedEmbedder, SharedGenerator};
pub use message::{ChatMessage, RenderFlags, Role};
pub use retention::{RetentionController, RetentionReport};
pub use service::MemoryService;
pub use store::{
    EntityEntry, HistoryEntry, InMemoryStore, JsonFileStore, KeyValueStore, MemoryRecord,
    MemoryStore, ScopeId, ScopeKind, SharedStore,
};
pub use testing::{MockEmbedder, MockGenerator, TestHarness};

//! Testing utilities for the memory engine.
//!
//! This module provides tools for deterministic tests without a model:
//! - `MockGenerator` with scripted replies, failures, hangs and a gate
//! - `MockEmbedder` with bag-of-words vectors
//! - `FlakyStore` for exercising store failures
//! - `TestHarness` for driving a transcript through a `MemoryService`

use crate::config::MemoryConfig;
use crate::consolidation::ConsolidationOutcome;
use crate::error::{GenerationError, GenerationResult, Result, StoreError, StoreResult};
use crate::generate::{Embedder, GenerationOptions, Generator, SharedEmbedder};
use crate::message::{ChatMessage, Role};
use crate::service::MemoryService;
use crate::store::{InMemoryStore, KeyValueStore, MemoryRecord, ScopeId};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Reply used once the script runs out.
const DEFAULT_REPLY: &str = "The conversation continued.";

/// A scripted reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this text.
    Text(String),
    /// Fail with this error.
    Fail(GenerationError),
    /// Never return.
    Hang,
}

/// A generator that returns scripted replies in order.
#[derive(Debug, Default)]
pub struct MockGenerator {
    script: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl MockGenerator {
    /// A generator with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a text reply.
    pub fn respond(self, text: impl Into<String>) -> Self {
        self.script.lock().push_back(MockReply::Text(text.into()));
        self
    }

    /// Queue a failure.
    pub fn fail(self, error: GenerationError) -> Self {
        self.script.lock().push_back(MockReply::Fail(error));
        self
    }

    /// Queue a reply that never arrives.
    pub fn hang(self) -> Self {
        self.script.lock().push_back(MockReply::Hang);
        self
    }

    /// Hold every call until [`MockGenerator::release`] lets it through.
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `n` held calls through.
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Queue a reply at runtime.
    pub fn queue(&self, reply: MockReply) {
        self.script.lock().push_back(reply);
    }

    /// Number of calls started.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Wait until at least `n` calls have started.
    pub async fn wait_for_calls(&self, n: usize) {
        while self.calls() < n {
            tokio::task::yield_now().await;
        }
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn generate(&self, prompt: &str, _options: &GenerationOptions) -> GenerationResult<String> {
        self.prompts.lock().push(prompt.to_string());
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| GenerationError::Other("gate closed".to_string()))?
                .forget();
        }

        let reply = self.script.lock().pop_front();
        match reply.unwrap_or_else(|| MockReply::Text(DEFAULT_REPLY.to_string())) {
            MockReply::Text(text) => Ok(text),
            MockReply::Fail(error) => Err(error),
            MockReply::Hang => std::future::pending().await,
        }
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// Dimensions of [`MockEmbedder`] vectors.
const EMBED_DIMS: usize = 256;

/// Deterministic bag-of-words embedder: each lowercase word bumps one
/// hashed dimension.
#[derive(Debug, Default)]
pub struct MockEmbedder {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    /// A working embedder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail (or work again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of embed calls.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The vector for `text`.
    pub fn vector(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; EMBED_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            vector[fnv1a(&word.to_lowercase()) % EMBED_DIMS] += 1.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> GenerationResult<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Suspend once, like a real backend call, so concurrent callers interleave.
        tokio::task::yield_now().await;
        if self.failing.load(Ordering::SeqCst) {
            return Err(GenerationError::Network("embedding backend down".to_string()));
        }
        Ok(Self::vector(text))
    }
}

fn fnv1a(word: &str) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as usize
}

/// A store whose writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryStore,
    fail_writes: AtomicBool,
}

impl FlakyStore {
    /// A store that works until told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `set` and `delete` fail (or work again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Backend("disk full".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, scope: &ScopeId, key: &str) -> StoreResult<Option<Value>> {
        self.inner.get(scope, key).await
    }

    async fn set(&self, scope: &ScopeId, key: &str, value: Value) -> StoreResult<()> {
        self.check()?;
        self.inner.set(scope, key, value).await
    }

    async fn delete(&self, scope: &ScopeId, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(scope, key).await
    }
}

/// Test harness driving one chat transcript through a [`MemoryService`].
pub struct TestHarness {
    /// The service under test.
    pub service: MemoryService,
    /// The generator behind it.
    pub generator: Arc<MockGenerator>,
    /// The scope every call uses.
    pub scope: ScopeId,
    /// The transcript so far.
    pub messages: Vec<ChatMessage>,
}

impl TestHarness {
    /// Create a harness over an in-memory store.
    pub fn new(config: MemoryConfig, generator: MockGenerator) -> Self {
        let generator = Arc::new(generator);
        let service = MemoryService::new(config, generator.clone(), Arc::new(InMemoryStore::new()))
            .unwrap_or_else(|e| panic!("invalid test config: {e}"));
        Self {
            service,
            generator,
            scope: ScopeId::chat("test-chat"),
            messages: Vec::new(),
        }
    }

    /// Use `embedder` for the archive.
    pub fn with_embedder(mut self, embedder: SharedEmbedder) -> Self {
        self.service = self.service.with_embedder(embedder);
        self
    }

    /// Append a message without running the trigger check.
    pub fn push(&mut self, speaker: &str, role: Role, text: impl Into<String>) -> &mut Self {
        let index = self.messages.len();
        self.messages.push(ChatMessage::new(index, speaker, role, text));
        self
    }

    /// Append a user message and run the trigger check.
    pub async fn user(&mut self, text: impl Into<String>) -> Result<ConsolidationOutcome> {
        self.push("User", Role::User, text);
        self.service.on_new_message(&self.scope, &self.messages).await
    }

    /// Append a character message and run the trigger check.
    pub async fn character(&mut self, text: impl Into<String>) -> Result<ConsolidationOutcome> {
        self.push("Character", Role::Character, text);
        self.service.on_new_message(&self.scope, &self.messages).await
    }

    /// Alternate user and character lines, triggering after each.
    pub async fn converse(&mut self, lines: &[&str]) -> Vec<Result<ConsolidationOutcome>> {
        let mut outcomes = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            let outcome = if i % 2 == 0 {
                self.user(*line).await
            } else {
                self.character(*line).await
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Force a consolidation of the current transcript.
    pub async fn force(&self) -> Result<ConsolidationOutcome> {
        self.service.force_consolidate(&self.scope, &self.messages).await
    }

    /// Memory of the harness scope.
    pub async fn snapshot(&self) -> MemoryRecord {
        self.service
            .get_memory_snapshot(&self.scope)
            .await
            .unwrap_or_else(|e| panic!("snapshot failed: {e}"))
    }

    /// Injection text for the harness scope.
    pub async fn injection(&self, query: Option<&str>) -> String {
        self.service
            .get_injection_text(&self.scope, query)
            .await
            .unwrap_or_else(|e| panic!("injection failed: {e}"))
    }
}

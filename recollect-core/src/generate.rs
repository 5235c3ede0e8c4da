//! Contracts for the host's text generation and embedding backends.
//!
//! The engine never talks to a provider directly. Hosts implement
//! [`Generator`] (and optionally [`Embedder`]) over whatever transport they
//! use; failures come back as [`GenerationError`].

use crate::error::{GenerationError, GenerationResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Opaque text generation.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate text for `prompt`.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationResult<String>;

    /// Name for logging.
    fn name(&self) -> &str {
        "generator"
    }
}

/// Computes embedding vectors for text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> GenerationResult<Vec<f32>>;
}

/// Shared generator handle.
pub type SharedGenerator = Arc<dyn Generator>;

/// Shared embedder handle.
pub type SharedEmbedder = Arc<dyn Embedder>;

/// Decoding parameters passed to every generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Temperature (0.0 - 2.0).
    pub temperature: f32,
    /// Stop sequences.
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 400,
            temperature: 0.3,
            stop_sequences: Vec::new(),
        }
    }
}

impl GenerationOptions {
    /// Set max tokens
    pub fn with_max_tokens(mut self, max: usize) -> Self {
        self.max_tokens = max;
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp.clamp(0.0, 2.0);
        self
    }

    /// Add a stop sequence
    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop_sequences.push(stop.into());
        self
    }
}

/// Adapter turning an async closure into a [`Generator`].
pub struct FnGenerator<F> {
    name: String,
    f: F,
}

impl<F> FnGenerator<F> {
    /// Wrap `f`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(String, GenerationOptions) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = GenerationResult<String>> + Send,
{
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationResult<String> {
        (self.f)(prompt.to_string(), options.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Placeholder embedder used when the host configured none: every call
/// fails with [`GenerationError::NotConfigured`], which the archive turns
/// into an empty result.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEmbedder;

#[async_trait]
impl Embedder for NoEmbedder {
    async fn embed(&self, _text: &str) -> GenerationResult<Vec<f32>> {
        Err(GenerationError::NotConfigured("embedding".to_string()))
    }
}

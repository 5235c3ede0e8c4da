//! Long-term archive of excluded messages with embedding retrieval.
//!
//! Entries are append-only. Free-standing texts are never deduplicated;
//! a transcript message is archived at most once. Embedding failures are
//! never errors: a text that cannot be embedded is skipped when archiving,
//! and a query that cannot be embedded retrieves nothing.

use crate::error::StoreResult;
use crate::generate::SharedEmbedder;
use crate::store::{ArchiveEntry, ArchiveEntryId, MemoryStore, ScopeId};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Default cut for archived text.
const DEFAULT_MAX_CHARS: usize = 1000;

/// Text to archive, optionally tied to the message it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveItem {
    /// Cleaned text.
    pub text: String,
    /// Transcript index of the source message.
    pub source_index: Option<usize>,
}

impl ArchiveItem {
    /// Item from a message.
    pub fn from_message(index: usize, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_index: Some(index),
        }
    }

    /// Free-standing item.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_index: None,
        }
    }
}

/// An archive entry with its similarity to a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub entry: ArchiveEntry,
    pub score: f32,
}

/// Embedding-indexed archive, stored per scope next to the memory record.
pub struct VectorArchive {
    embedder: SharedEmbedder,
    store: Arc<MemoryStore>,
    max_chars: AtomicUsize,
}

impl VectorArchive {
    /// Create an archive over `store`.
    pub fn new(embedder: SharedEmbedder, store: Arc<MemoryStore>) -> Self {
        Self {
            embedder,
            store,
            max_chars: AtomicUsize::new(DEFAULT_MAX_CHARS),
        }
    }

    /// Cut archived text to `max_chars` characters.
    pub fn with_max_chars(self, max_chars: usize) -> Self {
        self.set_max_chars(max_chars);
        self
    }

    /// Change the cut for texts archived from now on.
    pub fn set_max_chars(&self, max_chars: usize) {
        self.max_chars.store(max_chars.max(1), Ordering::Relaxed);
    }

    /// Archive one text. Returns whether an entry was added.
    pub async fn archive(&self, scope: &ScopeId, text: &str) -> StoreResult<bool> {
        let result = self
            .archive_batch(scope, vec![ArchiveItem::text(text)])
            .await?;
        Ok(result.added > 0)
    }

    /// Archive many texts. Embeddings are computed concurrently; entries are
    /// appended in input order in a single write.
    pub async fn archive_batch(
        &self,
        scope: &ScopeId,
        items: Vec<ArchiveItem>,
    ) -> StoreResult<BatchResult> {
        let max_chars = self.max_chars.load(Ordering::Relaxed);
        let items: Vec<ArchiveItem> = items
            .into_iter()
            .filter(|item| !item.text.trim().is_empty())
            .map(|item| ArchiveItem {
                text: truncate_chars(item.text.trim(), max_chars),
                source_index: item.source_index,
            })
            .collect();
        if items.is_empty() {
            return Ok(BatchResult::default());
        }

        let vectors = join_all(items.iter().map(|item| self.embedder.embed(&item.text))).await;

        let mut entries = Vec::with_capacity(items.len());
        let mut failed = 0;
        for (item, vector) in items.into_iter().zip(vectors) {
            match vector {
                Ok(vector) if !vector.is_empty() => {
                    entries.push(ArchiveEntry {
                        id: ArchiveEntryId::new(),
                        text: item.text,
                        vector,
                        timestamp: Utc::now(),
                        source_index: item.source_index,
                    });
                }
                Ok(_) => failed += 1,
                Err(e) => {
                    debug!(scope = %scope, error = %e, "Embedding failed, text not archived");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            warn!(scope = %scope, failed, "Some texts could not be embedded");
        }
        if entries.is_empty() {
            return Ok(BatchResult {
                failed,
                ..Default::default()
            });
        }

        let append = self.store.append_archive(scope, entries).await?;
        debug!(scope = %scope, added = append.added, total = append.total, "Archive extended");
        Ok(BatchResult {
            added: append.added,
            failed,
            archived: append.archived,
        })
    }

    /// Top `k` entries scoring at least `min_score` against `query`, best
    /// first. Equal scores keep insertion order.
    pub async fn retrieve(
        &self,
        scope: &ScopeId,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> StoreResult<Vec<ScoredEntry>> {
        if k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.store.archive_entries(scope).await?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = match self.embedder.embed(query).await {
            Ok(v) if !v.is_empty() => v,
            Ok(_) => return Ok(Vec::new()),
            Err(e) => {
                warn!(scope = %scope, error = %e, "Query embedding failed, nothing retrieved");
                return Ok(Vec::new());
            }
        };

        Ok(rank(&query_vector, entries, k, min_score))
    }

    /// Number of entries archived for a scope.
    pub async fn len(&self, scope: &ScopeId) -> StoreResult<usize> {
        Ok(self.store.archive_entries(scope).await?.len())
    }
}

/// Outcome of [`VectorArchive::archive_batch`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Entries appended.
    pub added: usize,
    /// Texts whose embedding failed.
    pub failed: usize,
    /// Source indices now archived.
    pub archived: BTreeSet<usize>,
}

/// Score and select entries.
pub fn rank(query: &[f32], entries: Vec<ArchiveEntry>, k: usize, min_score: f32) -> Vec<ScoredEntry> {
    let mut scored: Vec<ScoredEntry> = entries
        .into_iter()
        .filter(|e| e.vector.len() == query.len())
        .map(|entry| ScoredEntry {
            score: cosine_similarity(query, &entry.vector),
            entry,
        })
        .filter(|s| s.score >= min_score)
        .collect();

    // Stable sort: ties stay in insertion order.
    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored.truncate(k);
    scored
}

/// Cosine similarity between two embedding vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| *x as f64 * *y as f64)
        .sum();
    let mag_a: f64 = a.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();
    let mag_b: f64 = b.iter().map(|x| (*x as f64) * (*x as f64)).sum::<f64>().sqrt();

    if mag_a < f64::EPSILON || mag_b < f64::EPSILON {
        return 0.0;
    }

    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0) as f32
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => text[..byte].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate::NoEmbedder;
    use crate::store::InMemoryStore;
    use crate::testing::MockEmbedder;

    fn archive(embedder: SharedEmbedder) -> VectorArchive {
        let store = Arc::new(MemoryStore::new(Arc::new(InMemoryStore::new())));
        VectorArchive::new(embedder, store)
    }

    fn entry(text: &str, vector: Vec<f32>) -> ArchiveEntry {
        ArchiveEntry {
            id: ArchiveEntryId::new(),
            text: text.to_string(),
            vector,
            timestamp: Utc::now(),
            source_index: None,
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_rank_ties_keep_insertion_order() {
        let entries = vec![
            entry("first", vec![1.0, 0.0]),
            entry("weak", vec![1.0, 1.0]),
            entry("second", vec![2.0, 0.0]),
        ];
        let ranked = rank(&[1.0, 0.0], entries, 2, 0.0);
        let texts: Vec<_> = ranked.iter().map(|s| s.entry.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[test]
    fn test_rank_min_score_and_dimensions() {
        let entries = vec![
            entry("orthogonal", vec![0.0, 1.0]),
            entry("wrong dims", vec![1.0, 0.0, 0.0]),
            entry("match", vec![1.0, 0.1]),
        ];
        let ranked = rank(&[1.0, 0.0], entries, 5, 0.5);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].entry.text, "match");
    }

    #[tokio::test]
    async fn test_archive_and_retrieve() {
        let archive = archive(Arc::new(MockEmbedder::new()));
        let scope = ScopeId::chat("c");

        archive.archive(&scope, "the dragon sleeps in the mountain").await.unwrap();
        archive.archive(&scope, "bread and cheese at the inn").await.unwrap();

        let hits = archive
            .retrieve(&scope, "where is the dragon", 1, 0.1)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].entry.text.contains("dragon"));
    }

    #[tokio::test]
    async fn test_embedding_failure_degrades() {
        let archive = archive(Arc::new(NoEmbedder));
        let scope = ScopeId::chat("c");

        assert!(!archive.archive(&scope, "anything").await.unwrap());
        assert!(archive
            .retrieve(&scope, "anything", 3, 0.0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_batch_truncates_and_marks_sources() {
        let archive = archive(Arc::new(MockEmbedder::new())).with_max_chars(5);
        let scope = ScopeId::chat("c");

        let result = archive
            .archive_batch(
                &scope,
                vec![
                    ArchiveItem::from_message(3, "abcdefgh"),
                    ArchiveItem::from_message(4, "   "),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result.added, 1);
        assert_eq!(result.archived, BTreeSet::from([3]));
        assert_eq!(archive.len(&scope).await.unwrap(), 1);

        let record = archive.store.get(&scope).await.unwrap();
        assert!(record.archived_indices.contains(&3));
        let entries = archive.store.archive_entries(&scope).await.unwrap();
        assert_eq!(entries[0].text, "abcde");
    }
}

//! Context retention (pruning).
//!
//! Retention decides which raw messages the host leaves out of the next
//! generation request. It only sets the advisory `excluded_from_context`
//! flag; message text is never touched.

use crate::archive::{ArchiveItem, VectorArchive};
use crate::budget::SharedEstimator;
use crate::cleaner::TextCleaner;
use crate::error::StoreResult;
use crate::message::ChatMessage;
use crate::store::{MemoryRecord, ScopeId};
use std::collections::BTreeSet;
use tracing::debug;

/// Result of applying retention to a transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Indices flagged as excluded.
    pub excluded: BTreeSet<usize>,
    /// Messages newly sent to the archive.
    pub archived: usize,
}

/// Computes and applies message exclusions under a token budget.
pub struct RetentionController {
    estimator: SharedEstimator,
}

impl RetentionController {
    /// Create a controller measuring text with `estimator`.
    pub fn new(estimator: SharedEstimator) -> Self {
        Self { estimator }
    }

    /// Indices of messages to leave out of context.
    ///
    /// Walking back from the newest message, tokens accumulate until they
    /// exceed `token_budget`; that message and everything older is excluded.
    /// Messages at or after `cursor - buffer` are never excluded, so the
    /// boundary is `min(budget cutoff, cursor - buffer)`. Unconsolidated
    /// messages are therefore always kept.
    pub fn compute_exclusions(
        &self,
        messages: &[ChatMessage],
        cursor: usize,
        token_budget: usize,
        buffer: usize,
    ) -> BTreeSet<usize> {
        let protected_from = cursor.min(messages.len()).saturating_sub(buffer);
        if protected_from == 0 {
            return BTreeSet::new();
        }

        let mut used = 0usize;
        let mut cutoff = None;
        for (pos, message) in messages.iter().enumerate().rev() {
            used = used.saturating_add(self.estimator.estimate(&message.text));
            if used > token_budget {
                cutoff = Some(pos);
                break;
            }
        }

        let Some(cutoff) = cutoff else {
            return BTreeSet::new();
        };
        // Positions strictly below `protected_from` and at or below `cutoff`.
        let last_excluded = cutoff.min(protected_from - 1);
        messages[..=last_excluded].iter().map(|m| m.index).collect()
    }

    /// Flag `messages` in place and archive newly excluded ones.
    ///
    /// Flags always mirror the current exclusions, so raising the budget
    /// brings messages back. Archiving happens once per message: indices in
    /// `record.archived_indices` are skipped.
    pub async fn apply(
        &self,
        scope: &ScopeId,
        messages: &mut [ChatMessage],
        record: &MemoryRecord,
        token_budget: usize,
        buffer: usize,
        archive: Option<(&VectorArchive, &TextCleaner)>,
    ) -> StoreResult<RetentionReport> {
        let excluded =
            self.compute_exclusions(messages, record.consolidated_cursor, token_budget, buffer);
        for message in messages.iter_mut() {
            message.excluded_from_context = excluded.contains(&message.index);
        }

        let mut report = RetentionReport {
            excluded,
            archived: 0,
        };
        let Some((archive, cleaner)) = archive else {
            return Ok(report);
        };

        let items: Vec<ArchiveItem> = messages
            .iter()
            .filter(|m| m.excluded_from_context && !record.archived_indices.contains(&m.index))
            .map(|m| ArchiveItem::from_message(m.index, cleaner.clean(&m.text)))
            .collect();
        if items.is_empty() {
            return Ok(report);
        }

        let result = archive.archive_batch(scope, items).await?;
        report.archived = result.added;
        debug!(
            scope = %scope,
            excluded = report.excluded.len(),
            archived = report.archived,
            "Retention applied"
        );
        Ok(report)
    }
}

//! Typed memory records over the host store.

use super::kv::SharedStore;
use super::record::{ArchiveEntry, HistoryEntry, MemoryRecord, RecordPatch};
use super::ScopeId;
use crate::error::StoreResult;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Key holding the [`MemoryRecord`] of a scope.
pub const MEMORY_KEY: &str = "memory";

/// Key holding the archive entries of a scope.
pub const ARCHIVE_KEY: &str = "archive";

/// Key holding the wipe epoch of a scope. Survives wipes; bumped by each.
pub const EPOCH_KEY: &str = "epoch";

/// Default number of history entries kept per scope.
const DEFAULT_HISTORY_CAP: usize = 20;

/// Entries written by [`MemoryStore::append_archive`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveAppend {
    /// Entries appended.
    pub added: usize,
    /// Source indices newly marked archived.
    pub archived: BTreeSet<usize>,
    /// Archive size after the write.
    pub total: usize,
}

/// Reads and writes memory records, one writer per scope at a time.
///
/// Every write is a read-modify-write under the scope's lock, so two
/// consolidations for the same scope can never interleave partial updates.
/// Different scopes never contend.
///
/// Each wipe bumps the scope's epoch. Writers that read state before a wipe
/// use [`MemoryStore::modify_in_epoch`] so they cannot write it back after.
pub struct MemoryStore {
    kv: SharedStore,
    history_cap: usize,
    locks: Mutex<HashMap<ScopeId, Arc<AsyncMutex<()>>>>,
}

impl MemoryStore {
    /// Wrap a host store.
    pub fn new(kv: SharedStore) -> Self {
        Self {
            kv,
            history_cap: DEFAULT_HISTORY_CAP,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set how many history entries are kept.
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap.max(1);
        self
    }

    /// The history cap.
    pub fn history_cap(&self) -> usize {
        self.history_cap
    }

    /// Acquire the write lock of a scope.
    pub async fn lock_scope(&self, scope: &ScopeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            locks.entry(scope.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Read the record of a scope. Missing records read as empty.
    pub async fn get(&self, scope: &ScopeId) -> StoreResult<MemoryRecord> {
        self.read_record(scope).await
    }

    /// Merge `patch` into the stored record.
    pub async fn update(&self, scope: &ScopeId, patch: RecordPatch) -> StoreResult<MemoryRecord> {
        self.commit(scope, patch, None).await
    }

    /// Append to the audit trail, evicting the oldest entries beyond the cap.
    pub async fn append_history(&self, scope: &ScopeId, entry: HistoryEntry) -> StoreResult<MemoryRecord> {
        self.commit(scope, RecordPatch::default(), Some(entry)).await
    }

    /// Apply a patch and an optional history entry as one write.
    pub async fn commit(
        &self,
        scope: &ScopeId,
        patch: RecordPatch,
        history: Option<HistoryEntry>,
    ) -> StoreResult<MemoryRecord> {
        let _guard = self.lock_scope(scope).await;
        let mut record = self.read_record(scope).await?;
        patch.apply_to(&mut record);
        if let Some(entry) = history {
            record.push_history(entry, self.history_cap);
        }
        self.write_record(scope, &record).await?;
        debug!(
            scope = %scope,
            cursor = record.consolidated_cursor,
            history = record.history.len(),
            "Memory record written"
        );
        Ok(record)
    }

    /// Apply `modify` to the stored record under the scope lock.
    pub async fn modify<F>(&self, scope: &ScopeId, modify: F) -> StoreResult<MemoryRecord>
    where
        F: FnOnce(&mut MemoryRecord) + Send,
    {
        let _guard = self.lock_scope(scope).await;
        let mut record = self.read_record(scope).await?;
        modify(&mut record);
        self.write_record(scope, &record).await?;
        Ok(record)
    }

    /// Like [`MemoryStore::modify`], but only if no wipe happened since
    /// `epoch` was read. Returns `None` and writes nothing otherwise.
    pub async fn modify_in_epoch<F>(
        &self,
        scope: &ScopeId,
        epoch: u64,
        modify: F,
    ) -> StoreResult<Option<MemoryRecord>>
    where
        F: FnOnce(&mut MemoryRecord) + Send,
    {
        let _guard = self.lock_scope(scope).await;
        let current = self.read_epoch(scope).await?;
        if current != epoch {
            debug!(scope = %scope, epoch, current, "Scope wiped meanwhile, write dropped");
            return Ok(None);
        }
        let mut record = self.read_record(scope).await?;
        modify(&mut record);
        self.write_record(scope, &record).await?;
        Ok(Some(record))
    }

    /// Current wipe epoch of a scope. Never-wiped scopes are at 0.
    pub async fn epoch(&self, scope: &ScopeId) -> StoreResult<u64> {
        self.read_epoch(scope).await
    }

    /// Reset a scope: record and archive are both removed.
    ///
    /// The epoch is bumped first so in-flight writers are fenced even if a
    /// delete fails. The archive goes before the record, so a failure in
    /// between never leaves archived entries the record no longer tracks.
    pub async fn wipe(&self, scope: &ScopeId) -> StoreResult<()> {
        let guard = self.lock_scope(scope).await;
        let epoch = self.read_epoch(scope).await?;
        self.kv
            .set(scope, EPOCH_KEY, serde_json::to_value(epoch + 1)?)
            .await?;
        self.kv.delete(scope, ARCHIVE_KEY).await?;
        self.kv.delete(scope, MEMORY_KEY).await?;
        drop(guard);
        self.prune_lock(scope);
        debug!(scope = %scope, epoch = epoch + 1, "Memory wiped");
        Ok(())
    }

    /// Drop the lock entry of a scope nobody is waiting on.
    fn prune_lock(&self, scope: &ScopeId) {
        let mut locks = self.locks.lock();
        if locks
            .get(scope)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(scope);
        }
    }

    /// Number of scopes with a live lock entry.
    pub fn tracked_scopes(&self) -> usize {
        self.locks.lock().len()
    }

    /// Read the archive of a scope.
    pub async fn archive_entries(&self, scope: &ScopeId) -> StoreResult<Vec<ArchiveEntry>> {
        match self.kv.get(scope, ARCHIVE_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    /// Append archive entries and mark their source messages archived, as one
    /// serialized write for the scope.
    ///
    /// Entries whose source message is already archived are dropped here,
    /// under the lock, so overlapping callers archive each message once.
    pub async fn append_archive(
        &self,
        scope: &ScopeId,
        entries: Vec<ArchiveEntry>,
    ) -> StoreResult<ArchiveAppend> {
        let _guard = self.lock_scope(scope).await;

        let mut record = self.read_record(scope).await?;
        let mut archived = BTreeSet::new();
        let entries: Vec<ArchiveEntry> = entries
            .into_iter()
            .filter(|entry| match entry.source_index {
                Some(index) => !record.archived_indices.contains(&index) && archived.insert(index),
                None => true,
            })
            .collect();

        let mut existing = self.archive_entries(scope).await?;
        if entries.is_empty() {
            return Ok(ArchiveAppend {
                total: existing.len(),
                ..Default::default()
            });
        }
        let added = entries.len();
        existing.extend(entries);
        let total = existing.len();
        self.kv
            .set(scope, ARCHIVE_KEY, serde_json::to_value(&existing)?)
            .await?;

        if !archived.is_empty() {
            RecordPatch::default()
                .with_archived(archived.clone())
                .apply_to(&mut record);
            self.write_record(scope, &record).await?;
        }

        Ok(ArchiveAppend {
            added,
            archived,
            total,
        })
    }

    async fn read_epoch(&self, scope: &ScopeId) -> StoreResult<u64> {
        match self.kv.get(scope, EPOCH_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(0),
        }
    }

    async fn read_record(&self, scope: &ScopeId) -> StoreResult<MemoryRecord> {
        match self.kv.get(scope, MEMORY_KEY).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(MemoryRecord::default()),
        }
    }

    async fn write_record(&self, scope: &ScopeId, record: &MemoryRecord) -> StoreResult<()> {
        self.kv
            .set(scope, MEMORY_KEY, serde_json::to_value(record)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ArchiveEntryId, InMemoryStore};
    use chrono::Utc;

    fn store() -> MemoryStore {
        MemoryStore::new(Arc::new(InMemoryStore::new())).with_history_cap(3)
    }

    fn archived(index: usize) -> ArchiveEntry {
        ArchiveEntry {
            id: ArchiveEntryId::new(),
            text: format!("message {index}"),
            vector: vec![1.0],
            timestamp: Utc::now(),
            source_index: Some(index),
        }
    }

    #[tokio::test]
    async fn test_get_missing_is_empty() {
        let store = store();
        let record = store.get(&ScopeId::chat("new")).await.unwrap();
        assert_eq!(record, MemoryRecord::default());
    }

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = store();
        let scope = ScopeId::chat("c");

        store
            .update(&scope, RecordPatch::default().with_summary("first"))
            .await
            .unwrap();
        let record = store
            .update(&scope, RecordPatch::default().with_cursor(4))
            .await
            .unwrap();

        assert_eq!(record.rolling_summary, "first");
        assert_eq!(record.consolidated_cursor, 4);
    }

    #[tokio::test]
    async fn test_append_history_caps() {
        let store = store();
        let scope = ScopeId::chat("c");
        for i in 0..5 {
            store
                .append_history(&scope, HistoryEntry::now(format!("s{i}"), i))
                .await
                .unwrap();
        }
        let record = store.get(&scope).await.unwrap();
        assert_eq!(record.history.len(), 3);
        assert_eq!(record.history[0].summary, "s2");
    }

    #[tokio::test]
    async fn test_wipe_resets_everything() {
        let store = store();
        let scope = ScopeId::chat("c");
        store
            .commit(
                &scope,
                RecordPatch::default().with_summary("s").with_cursor(7),
                Some(HistoryEntry::now("s", 7)),
            )
            .await
            .unwrap();
        store
            .append_archive(&scope, vec![archived(1), archived(2)])
            .await
            .unwrap();

        store.wipe(&scope).await.unwrap();
        let record = store.get(&scope).await.unwrap();
        assert_eq!(record, MemoryRecord::default());
        assert!(store.archive_entries(&scope).await.unwrap().is_empty());
        assert_eq!(store.epoch(&scope).await.unwrap(), 1);
        assert_eq!(store.tracked_scopes(), 0);
    }

    #[tokio::test]
    async fn test_write_after_wipe_is_dropped() {
        let store = store();
        let scope = ScopeId::chat("c");
        store
            .update(&scope, RecordPatch::default().with_summary("old"))
            .await
            .unwrap();
        let epoch = store.epoch(&scope).await.unwrap();

        store.wipe(&scope).await.unwrap();
        let written = store
            .modify_in_epoch(&scope, epoch, |r| {
                r.rolling_summary = "old plus new".to_string();
                r.consolidated_cursor = 5;
            })
            .await
            .unwrap();

        assert!(written.is_none());
        assert_eq!(store.get(&scope).await.unwrap(), MemoryRecord::default());

        let epoch = store.epoch(&scope).await.unwrap();
        let written = store
            .modify_in_epoch(&scope, epoch, |r| r.consolidated_cursor = 2)
            .await
            .unwrap();
        assert_eq!(written.unwrap().consolidated_cursor, 2);
    }

    #[tokio::test]
    async fn test_append_archive_skips_archived_sources() {
        let store = store();
        let scope = ScopeId::chat("c");

        let first = store
            .append_archive(&scope, vec![archived(0), archived(1)])
            .await
            .unwrap();
        assert_eq!(first.added, 2);
        assert_eq!(first.archived, BTreeSet::from([0, 1]));

        let second = store
            .append_archive(&scope, vec![archived(1), archived(2), archived(2)])
            .await
            .unwrap();
        assert_eq!(second.added, 1);
        assert_eq!(second.archived, BTreeSet::from([2]));
        assert_eq!(second.total, 3);
        assert_eq!(
            store.get(&scope).await.unwrap().archived_indices,
            BTreeSet::from([0, 1, 2])
        );
    }

    #[tokio::test]
    async fn test_concurrent_modifies_do_not_lose_writes() {
        let store = Arc::new(store());
        let scope = ScopeId::chat("busy");

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                let scope = scope.clone();
                tokio::spawn(async move {
                    store
                        .modify(&scope, move |r| {
                            r.merge_entity(&format!("entity{i}"), &[], "x");
                        })
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.get(&scope).await.unwrap().entities.len(), 16);
    }
}

//! Durable, append-only audit log of board changes.
//!
//! Distinct from undo: entries survive the session, record who changed what,
//! and can be used as restore targets. Only the owning session keeps one.
//!
//! ```text
//! Uninitialized ──initialize()──▶ Active ──flush()──▶ Flushed
//! ```
//!
//! Entries are buffered in memory and written through a [`HistoryStorage`]
//! on a debounce schedule. A failed write is logged and retried later; it
//! never affects the element store.

mod diff;

pub use diff::{ElementDiff, diff_elements};

use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::element::{Element, ElementId, sort_canonical};
use crate::storage::{DEFAULT_PERSIST_INTERVAL_MS, HistoryStorage, PersistSchedule, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

/// Board state stored in an entry. Kept as raw JSON so entries written by
/// other versions still load; decoding happens on restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(pub serde_json::Value);

impl Snapshot {
    pub fn from_elements(elements: &[Element]) -> Self {
        Self(serde_json::to_value(elements).unwrap_or(serde_json::Value::Null))
    }

    /// Decode the element list; `None` if the stored value is not one.
    pub fn elements(&self) -> Option<Vec<Element>> {
        let mut elements: Vec<Element> = serde_json::from_value(self.0.clone()).ok()?;
        sort_canonical(&mut elements);
        Some(elements)
    }
}

/// One logged change. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub entry_id: String,
    /// Milliseconds since the epoch.
    pub timestamp: u64,
    pub kind: OperationKind,
    pub affected_ids: Vec<ElementId>,
    /// Board state before the change.
    pub before: Snapshot,
    /// Board state after the change.
    pub after: Snapshot,
    /// Peer that made the change, `None` for the local user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Uninitialized,
    Active,
    Flushed,
}

pub struct HistoryManager {
    board_id: String,
    storage: Arc<dyn HistoryStorage>,
    clock: Rc<dyn Clock>,
    state: HistoryState,
    entries: Vec<HistoryEntry>,
    /// Logged but not yet written.
    pending: Vec<HistoryEntry>,
    schedule: PersistSchedule,
}

impl HistoryManager {
    pub fn new(board_id: impl Into<String>, storage: Arc<dyn HistoryStorage>, clock: Rc<dyn Clock>) -> Self {
        Self {
            board_id: board_id.into(),
            storage,
            clock,
            state: HistoryState::Uninitialized,
            entries: Vec::new(),
            pending: Vec::new(),
            schedule: PersistSchedule::new(DEFAULT_PERSIST_INTERVAL_MS),
        }
    }

    pub fn with_persist_interval(mut self, interval_ms: u64) -> Self {
        self.schedule = PersistSchedule::new(interval_ms);
        self
    }

    pub fn board_id(&self) -> &str {
        &self.board_id
    }

    pub fn state(&self) -> HistoryState {
        self.state
    }

    /// Load prior entries. A storage failure starts an empty log instead.
    /// Entries logged before this call are kept after the loaded ones,
    /// except those already persisted (and so present in the load).
    pub async fn initialize(&mut self) {
        if self.state != HistoryState::Uninitialized {
            return;
        }
        match self.storage.load(&self.board_id).await {
            Ok(mut loaded) => {
                log::debug!("Loaded {} history entries for {}", loaded.len(), self.board_id);
                let known: HashSet<String> = loaded.iter().map(|e| e.entry_id.clone()).collect();
                loaded.extend(self.entries.drain(..).filter(|e| !known.contains(&e.entry_id)));
                self.entries = loaded;
            }
            Err(e) => log::warn!("Failed to load history for {}: {}", self.board_id, e),
        }
        self.state = HistoryState::Active;
    }

    pub fn log_add(&mut self, ids: Vec<ElementId>, before: &[Element], after: &[Element], actor: Option<&str>) -> Option<String> {
        self.log(OperationKind::Add, ids, before, after, actor)
    }

    pub fn log_update(&mut self, ids: Vec<ElementId>, before: &[Element], after: &[Element], actor: Option<&str>) -> Option<String> {
        self.log(OperationKind::Update, ids, before, after, actor)
    }

    pub fn log_delete(&mut self, ids: Vec<ElementId>, before: &[Element], after: &[Element], actor: Option<&str>) -> Option<String> {
        self.log(OperationKind::Delete, ids, before, after, actor)
    }

    fn log(
        &mut self,
        kind: OperationKind,
        affected_ids: Vec<ElementId>,
        before: &[Element],
        after: &[Element],
        actor: Option<&str>,
    ) -> Option<String> {
        if self.state == HistoryState::Flushed {
            log::debug!("Ignoring {:?} entry after flush", kind);
            return None;
        }
        let now = self.clock.now_ms();
        let entry = HistoryEntry {
            entry_id: Uuid::new_v4().to_string(),
            timestamp: now,
            kind,
            affected_ids,
            before: Snapshot::from_elements(before),
            after: Snapshot::from_elements(after),
            actor: actor.map(str::to_string),
        };
        let id = entry.entry_id.clone();
        self.entries.push(entry.clone());
        self.pending.push(entry);
        self.schedule.mark_dirty(now);
        Some(id)
    }

    /// Diff two board states and log one entry per non-empty change kind,
    /// in add, update, delete order. Returns the new entry ids.
    pub fn record_diff(&mut self, before: &[Element], after: &[Element], actor: Option<&str>) -> Vec<String> {
        let ElementDiff {
            added,
            deleted,
            updated,
        } = diff_elements(before, after);
        let mut ids = Vec::new();
        if !added.is_empty() {
            ids.extend(self.log_add(added, before, after, actor));
        }
        if !updated.is_empty() {
            ids.extend(self.log_update(updated, before, after, actor));
        }
        if !deleted.is_empty() {
            ids.extend(self.log_delete(deleted, before, after, actor));
        }
        ids
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn entry(&self, entry_id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.entry_id == entry_id)
    }

    /// Board state right after an entry, for the caller to apply. `None` if
    /// the entry is unknown or its snapshot does not decode.
    pub fn restore_to_entry(&self, entry_id: &str) -> Option<Vec<Element>> {
        let entry = self.entry(entry_id)?;
        let elements = entry.after.elements();
        if elements.is_none() {
            log::warn!("History entry {} has an unreadable snapshot", entry_id);
        }
        elements
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether buffered entries are due for a write.
    pub fn should_persist(&self, now_ms: u64) -> bool {
        !self.pending.is_empty() && self.schedule.should_save(now_ms)
    }

    /// Write buffered entries. On failure they stay buffered for the next try.
    pub async fn persist(&mut self) -> StorageResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        match self.storage.append(&self.board_id, &batch).await {
            Ok(()) => {
                self.schedule.mark_saved(self.clock.now_ms());
                Ok(())
            }
            Err(e) => {
                let mut rest = std::mem::take(&mut self.pending);
                self.pending = batch;
                self.pending.append(&mut rest);
                self.schedule.mark_dirty(self.clock.now_ms());
                Err(e)
            }
        }
    }

    /// Best-effort final write of buffered entries plus the current board
    /// state. Always ends in `Flushed`; failures are logged.
    pub async fn flush(&mut self, current: &[Element]) {
        if self.state == HistoryState::Flushed {
            return;
        }
        if let Err(e) = self.persist().await {
            log::warn!("Failed to flush history for {}: {}", self.board_id, e);
        }
        if let Err(e) = self.storage.save_snapshot(&self.board_id, current).await {
            log::warn!("Failed to save board snapshot for {}: {}", self.board_id, e);
        }
        self.schedule.cancel();
        self.state = HistoryState::Flushed;
    }

    /// Drop the debounce deadline (teardown without a flush).
    pub fn cancel_pending_timer(&mut self) {
        self.schedule.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::element::ElementKind;
    use crate::storage::{BoxFuture, MemoryHistoryStorage, StorageError};
    use pollster::block_on;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn el(id: &str) -> Element {
        Element::with_id(id, ElementKind::Rectangle, 0.0, 0.0)
    }

    fn manager(storage: Arc<dyn HistoryStorage>) -> (HistoryManager, ManualClock) {
        let clock = ManualClock::new(1_000);
        let manager = HistoryManager::new("board", storage, Rc::new(clock.clone()));
        (manager, clock)
    }

    /// Storage whose writes fail while `broken` is set.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryHistoryStorage,
        broken: AtomicBool,
    }

    impl HistoryStorage for FlakyStorage {
        fn load(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Vec<HistoryEntry>>> {
            self.inner.load(board_id)
        }

        fn append(&self, board_id: &str, entries: &[HistoryEntry]) -> BoxFuture<'_, StorageResult<()>> {
            if self.broken.load(Ordering::SeqCst) {
                return Box::pin(async { Err(StorageError::Io("disk full".into())) });
            }
            self.inner.append(board_id, entries)
        }

        fn save_snapshot(&self, board_id: &str, elements: &[Element]) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.save_snapshot(board_id, elements)
        }

        fn load_snapshot(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Option<Vec<Element>>>> {
            self.inner.load_snapshot(board_id)
        }

        fn clear(&self, board_id: &str) -> BoxFuture<'_, StorageResult<()>> {
            self.inner.clear(board_id)
        }
    }

    #[test]
    fn test_record_diff_logs_per_kind() {
        let (mut history, _) = manager(Arc::new(MemoryHistoryStorage::new()));
        block_on(history.initialize());

        let mut moved = el("b");
        moved.x = 5.0;
        let ids = history.record_diff(&[el("a"), el("b")], &[moved, el("c")], Some("peer-1"));
        assert_eq!(ids.len(), 3);

        let kinds: Vec<_> = history.entries().iter().map(|e| (e.kind, e.affected_ids.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (OperationKind::Add, vec!["c".to_string()]),
                (OperationKind::Update, vec!["b".to_string()]),
                (OperationKind::Delete, vec!["a".to_string()]),
            ]
        );
        assert_eq!(history.entries()[0].actor.as_deref(), Some("peer-1"));
        assert_eq!(history.entries()[0].timestamp, 1_000);
    }

    #[test]
    fn test_no_change_no_entry() {
        let (mut history, _) = manager(Arc::new(MemoryHistoryStorage::new()));
        assert!(history.record_diff(&[el("a")], &[el("a")], None).is_empty());
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_restore_to_entry() {
        let (mut history, _) = manager(Arc::new(MemoryHistoryStorage::new()));
        let id = history.log_add(vec!["b".into()], &[el("a")], &[el("b"), el("a")], None).unwrap();

        assert_eq!(history.restore_to_entry(&id), Some(vec![el("a"), el("b")]));
        assert_eq!(history.restore_to_entry("missing"), None);
        assert_eq!(history.entry(&id).unwrap().before.elements(), Some(vec![el("a")]));
    }

    #[test]
    fn test_malformed_snapshot_restores_nothing() {
        let (mut history, _) = manager(Arc::new(MemoryHistoryStorage::new()));
        let id = history.log_add(vec!["a".into()], &[], &[el("a")], None).unwrap();
        history.entries[0].after = Snapshot(serde_json::json!({"not": "a board"}));
        assert_eq!(history.restore_to_entry(&id), None);
    }

    #[test]
    fn test_persist_debounced_and_reloaded() {
        let storage: Arc<dyn HistoryStorage> = Arc::new(MemoryHistoryStorage::new());
        let (mut history, clock) = manager(storage.clone());
        block_on(history.initialize());

        history.log_add(vec!["a".into()], &[], &[el("a")], None);
        assert!(!history.should_persist(clock.now_ms()));
        clock.advance(DEFAULT_PERSIST_INTERVAL_MS);
        assert!(history.should_persist(clock.now_ms()));
        block_on(history.persist()).unwrap();
        assert_eq!(history.pending_count(), 0);
        assert!(!history.should_persist(clock.now_ms() + 10_000));

        let (mut reloaded, _) = manager(storage);
        block_on(reloaded.initialize());
        assert_eq!(reloaded.entries(), history.entries());
    }

    #[test]
    fn test_write_failure_keeps_entries_buffered() {
        let storage = Arc::new(FlakyStorage::default());
        storage.broken.store(true, Ordering::SeqCst);
        let (mut history, _) = manager(storage.clone());
        block_on(history.initialize());

        history.log_add(vec!["a".into()], &[], &[el("a")], None);
        assert!(block_on(history.persist()).is_err());
        assert_eq!(history.pending_count(), 1);
        assert_eq!(history.entries().len(), 1);

        storage.broken.store(false, Ordering::SeqCst);
        block_on(history.persist()).unwrap();
        assert_eq!(block_on(storage.load("board")).unwrap().len(), 1);
    }

    #[test]
    fn test_flush_writes_pending_and_snapshot() {
        let storage: Arc<dyn HistoryStorage> = Arc::new(MemoryHistoryStorage::new());
        let (mut history, _) = manager(storage.clone());
        block_on(history.initialize());
        history.log_add(vec!["a".into()], &[], &[el("a")], None);

        block_on(history.flush(&[el("a")]));
        assert_eq!(history.state(), HistoryState::Flushed);
        assert_eq!(block_on(storage.load("board")).unwrap().len(), 1);
        assert_eq!(block_on(storage.load_snapshot("board")).unwrap(), Some(vec![el("a")]));

        assert!(history.log_delete(vec!["a".into()], &[el("a")], &[], None).is_none());
    }

    #[test]
    fn test_initialize_tolerates_load_failure() {
        struct Broken;
        impl HistoryStorage for Broken {
            fn load(&self, _: &str) -> BoxFuture<'_, StorageResult<Vec<HistoryEntry>>> {
                Box::pin(async { Err(StorageError::Other("offline".into())) })
            }
            fn append(&self, _: &str, _: &[HistoryEntry]) -> BoxFuture<'_, StorageResult<()>> {
                Box::pin(async { Ok(()) })
            }
            fn save_snapshot(&self, _: &str, _: &[Element]) -> BoxFuture<'_, StorageResult<()>> {
                Box::pin(async { Ok(()) })
            }
            fn load_snapshot(&self, _: &str) -> BoxFuture<'_, StorageResult<Option<Vec<Element>>>> {
                Box::pin(async { Ok(None) })
            }
            fn clear(&self, _: &str) -> BoxFuture<'_, StorageResult<()>> {
                Box::pin(async { Ok(()) })
            }
        }

        let (mut history, _) = manager(Arc::new(Broken));
        block_on(history.initialize());
        assert_eq!(history.state(), HistoryState::Active);
        assert!(history.entries().is_empty());
    }

    #[test]
    fn test_entries_persisted_before_initialize_load_once() {
        let storage: Arc<dyn HistoryStorage> = Arc::new(MemoryHistoryStorage::new());
        let (mut history, clock) = manager(storage.clone());

        let early = history.log_add(vec!["a".into()], &[], &[el("a")], None).unwrap();
        clock.advance(DEFAULT_PERSIST_INTERVAL_MS);
        block_on(history.persist()).unwrap();
        let late = history.log_add(vec!["b".into()], &[el("a")], &[el("a"), el("b")], None).unwrap();

        block_on(history.initialize());
        let ids: Vec<_> = history.entries().iter().map(|e| e.entry_id.as_str()).collect();
        assert_eq!(ids, [early.as_str(), late.as_str()]);
        assert_eq!(history.pending_count(), 1);
    }
}

//! In-memory history storage.

use super::{BoxFuture, HistoryStorage, StorageError, StorageResult};
use crate::element::Element;
use crate::history::HistoryEntry;
use std::collections::HashMap;
use std::sync::RwLock;

/// In-memory storage for testing and ephemeral use.
#[derive(Default)]
pub struct MemoryHistoryStorage {
    logs: RwLock<HashMap<String, Vec<HistoryEntry>>>,
    snapshots: RwLock<HashMap<String, Vec<Element>>>,
}

impl MemoryHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock_error(e: impl std::fmt::Display) -> StorageError {
    StorageError::Other(format!("Lock error: {}", e))
}

impl HistoryStorage for MemoryHistoryStorage {
    fn load(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Vec<HistoryEntry>>> {
        let board_id = board_id.to_string();
        Box::pin(async move {
            let logs = self.logs.read().map_err(lock_error)?;
            Ok(logs.get(&board_id).cloned().unwrap_or_default())
        })
    }

    fn append(&self, board_id: &str, entries: &[HistoryEntry]) -> BoxFuture<'_, StorageResult<()>> {
        let board_id = board_id.to_string();
        let entries = entries.to_vec();
        Box::pin(async move {
            let mut logs = self.logs.write().map_err(lock_error)?;
            logs.entry(board_id).or_default().extend(entries);
            Ok(())
        })
    }

    fn save_snapshot(&self, board_id: &str, elements: &[Element]) -> BoxFuture<'_, StorageResult<()>> {
        let board_id = board_id.to_string();
        let elements = elements.to_vec();
        Box::pin(async move {
            let mut snapshots = self.snapshots.write().map_err(lock_error)?;
            snapshots.insert(board_id, elements);
            Ok(())
        })
    }

    fn load_snapshot(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Option<Vec<Element>>>> {
        let board_id = board_id.to_string();
        Box::pin(async move {
            let snapshots = self.snapshots.read().map_err(lock_error)?;
            Ok(snapshots.get(&board_id).cloned())
        })
    }

    fn clear(&self, board_id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let board_id = board_id.to_string();
        Box::pin(async move {
            self.logs.write().map_err(lock_error)?.remove(&board_id);
            self.snapshots.write().map_err(lock_error)?.remove(&board_id);
            Ok(())
        })
    }
}

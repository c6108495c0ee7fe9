//! Storage abstraction for board history persistence.

mod debounce;
mod memory;

#[cfg(not(target_arch = "wasm32"))]
mod file;

pub use debounce::{DEFAULT_PERSIST_INTERVAL_MS, PersistSchedule};
pub use memory::MemoryHistoryStorage;

#[cfg(not(target_arch = "wasm32"))]
pub use file::FileHistoryStorage;

use crate::element::Element;
use crate::history::HistoryEntry;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Board not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Boxed future for async operations (compatible with WASM).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Append-only history log plus the last flushed board state, per board.
///
/// Implementations can keep data in memory, on the filesystem, or in a
/// remote service. Loading is lenient: records that fail to decode are
/// skipped, not reported as errors.
pub trait HistoryStorage: Send + Sync {
    /// Every stored entry for a board, oldest first. A board with no
    /// history yields an empty list.
    fn load(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Vec<HistoryEntry>>>;

    /// Append entries to a board's log.
    fn append(&self, board_id: &str, entries: &[HistoryEntry]) -> BoxFuture<'_, StorageResult<()>>;

    /// Store the board state captured at flush time.
    fn save_snapshot(&self, board_id: &str, elements: &[Element]) -> BoxFuture<'_, StorageResult<()>>;

    /// Last stored board state, if any.
    fn load_snapshot(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Option<Vec<Element>>>>;

    /// Remove a board's log and snapshot.
    fn clear(&self, board_id: &str) -> BoxFuture<'_, StorageResult<()>>;
}

/// Create the platform default history storage.
#[cfg(not(target_arch = "wasm32"))]
pub fn create_default_storage() -> StorageResult<std::sync::Arc<FileHistoryStorage>> {
    Ok(std::sync::Arc::new(FileHistoryStorage::default_location()?))
}

//! File-based history storage for native platforms.

use super::{BoxFuture, HistoryStorage, StorageError, StorageResult};
use crate::element::Element;
use crate::history::HistoryEntry;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// File-based storage for native platforms.
///
/// Each board gets a JSON-lines log (`<board>.jsonl`, one entry per line)
/// and a snapshot file (`<board>.snapshot.json`) in the base directory.
pub struct FileHistoryStorage {
    base_path: PathBuf,
}

impl FileHistoryStorage {
    /// Create storage rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: PathBuf) -> StorageResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StorageError::Io(format!("Failed to create storage directory: {}", e))
            })?;
        }
        Ok(Self { base_path })
    }

    /// Create storage in the default location.
    ///
    /// On Linux: `~/.local/share/tandem/history/`
    /// On Windows: `%LOCALAPPDATA%\tandem\history\`
    pub fn default_location() -> StorageResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StorageError::Io("Could not determine home directory".to_string()))?;
        Self::new(base.join("tandem").join("history"))
    }

    fn safe_id(board_id: &str) -> String {
        board_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect()
    }

    fn log_path(&self, board_id: &str) -> PathBuf {
        self.base_path.join(format!("{}.jsonl", Self::safe_id(board_id)))
    }

    fn snapshot_path(&self, board_id: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.snapshot.json", Self::safe_id(board_id)))
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

fn parse_log(path: &Path, text: &str) -> Vec<HistoryEntry> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(n, line)| match serde_json::from_str::<HistoryEntry>(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Skipping malformed history line {} in {}: {}", n + 1, path.display(), e);
                None
            }
        })
        .collect()
}

impl HistoryStorage for FileHistoryStorage {
    fn load(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Vec<HistoryEntry>>> {
        let path = self.log_path(board_id);
        Box::pin(async move {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let text = fs::read_to_string(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read {}: {}", path.display(), e))
            })?;
            Ok(parse_log(&path, &text))
        })
    }

    fn append(&self, board_id: &str, entries: &[HistoryEntry]) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.log_path(board_id);
        let mut lines = String::new();
        for entry in entries {
            match serde_json::to_string(entry) {
                Ok(line) => {
                    lines.push_str(&line);
                    lines.push('\n');
                }
                Err(e) => {
                    let err = StorageError::Serialization(e.to_string());
                    return Box::pin(async move { Err(err) });
                }
            }
        }

        Box::pin(async move {
            if lines.is_empty() {
                return Ok(());
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::Io(format!("Failed to open {}: {}", path.display(), e)))?;
            file.write_all(lines.as_bytes())
                .map_err(|e| StorageError::Io(format!("Failed to write {}: {}", path.display(), e)))
        })
    }

    fn save_snapshot(&self, board_id: &str, elements: &[Element]) -> BoxFuture<'_, StorageResult<()>> {
        let path = self.snapshot_path(board_id);
        let json = match serde_json::to_string_pretty(elements) {
            Ok(j) => j,
            Err(e) => {
                return Box::pin(async move { Err(StorageError::Serialization(e.to_string())) });
            }
        };

        Box::pin(async move {
            fs::write(&path, json).map_err(|e| {
                StorageError::Io(format!("Failed to write {}: {}", path.display(), e))
            })
        })
    }

    fn load_snapshot(&self, board_id: &str) -> BoxFuture<'_, StorageResult<Option<Vec<Element>>>> {
        let path = self.snapshot_path(board_id);
        Box::pin(async move {
            if !path.exists() {
                return Ok(None);
            }
            let json = fs::read_to_string(&path).map_err(|e| {
                StorageError::Io(format!("Failed to read {}: {}", path.display(), e))
            })?;
            serde_json::from_str(&json).map(Some).map_err(|e| {
                StorageError::Serialization(format!("Failed to parse {}: {}", path.display(), e))
            })
        })
    }

    fn clear(&self, board_id: &str) -> BoxFuture<'_, StorageResult<()>> {
        let paths = [self.log_path(board_id), self.snapshot_path(board_id)];
        Box::pin(async move {
            for path in paths {
                if path.exists() {
                    fs::remove_file(&path).map_err(|e| {
                        StorageError::Io(format!("Failed to delete {}: {}", path.display(), e))
                    })?;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::ElementKind;
    use crate::history::{OperationKind, Snapshot};
    use pollster::block_on;
    use tempfile::tempdir;

    fn entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            entry_id: id.to_string(),
            timestamp: 7,
            kind: OperationKind::Delete,
            affected_ids: vec!["a".into()],
            before: Snapshot::from_elements(&[Element::with_id("a", ElementKind::Line, 0.0, 0.0)]),
            after: Snapshot::from_elements(&[]),
            actor: Some("peer".into()),
        }
    }

    #[test]
    fn test_append_and_load() {
        let dir = tempdir().unwrap();
        let storage = FileHistoryStorage::new(dir.path().to_path_buf()).unwrap();

        assert!(block_on(storage.load("board")).unwrap().is_empty());
        block_on(storage.append("board", &[entry("1"), entry("2")])).unwrap();
        block_on(storage.append("board", &[entry("3")])).unwrap();

        let loaded = block_on(storage.load("board")).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0], entry("1"));
        assert_eq!(loaded[2].entry_id, "3");
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempdir().unwrap();
        let storage = FileHistoryStorage::new(dir.path().to_path_buf()).unwrap();
        block_on(storage.append("board", &[entry("1")])).unwrap();

        let path = dir.path().join("board.jsonl");
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("{not json\n\n");
        fs::write(&path, text).unwrap();
        block_on(storage.append("board", &[entry("2")])).unwrap();

        let ids: Vec<_> = block_on(storage.load("board"))
            .unwrap()
            .into_iter()
            .map(|e| e.entry_id)
            .collect();
        assert_eq!(ids, ["1", "2"]);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let dir = tempdir().unwrap();
        let storage = FileHistoryStorage::new(dir.path().to_path_buf()).unwrap();
        let elements = vec![Element::with_id("a", ElementKind::Ellipse, 1.0, 2.0)];

        block_on(storage.save_snapshot("board", &elements)).unwrap();
        assert_eq!(block_on(storage.load_snapshot("board")).unwrap(), Some(elements));

        block_on(storage.clear("board")).unwrap();
        assert_eq!(block_on(storage.load_snapshot("board")).unwrap(), None);
        assert!(block_on(storage.load("board")).unwrap().is_empty());
    }

    #[test]
    fn test_sanitizes_board_id() {
        let dir = tempdir().unwrap();
        let storage = FileHistoryStorage::new(dir.path().to_path_buf()).unwrap();

        block_on(storage.append("team/board:1", &[entry("1")])).unwrap();
        assert!(dir.path().join("team_board_1.jsonl").exists());
        assert_eq!(block_on(storage.load("team/board:1")).unwrap().len(), 1);
    }
}

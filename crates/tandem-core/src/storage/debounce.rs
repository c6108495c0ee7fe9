//! Debounced persistence scheduling.

/// Default quiet period before buffered history is written.
pub const DEFAULT_PERSIST_INTERVAL_MS: u64 = 2_000;

/// Tracks unsaved changes and decides when to write them.
///
/// A write becomes due once `interval_ms` has passed since the most recent
/// change, so a burst of edits produces one write.
#[derive(Debug, Clone)]
pub struct PersistSchedule {
    interval_ms: u64,
    dirty: bool,
    last_change_at: Option<u64>,
    last_save_at: Option<u64>,
}

impl PersistSchedule {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            dirty: false,
            last_change_at: None,
            last_save_at: None,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Record a change at `now_ms`, pushing the deadline back.
    pub fn mark_dirty(&mut self, now_ms: u64) {
        self.dirty = true;
        self.last_change_at = Some(now_ms);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Check if the quiet period has elapsed.
    pub fn should_save(&self, now_ms: u64) -> bool {
        if !self.dirty {
            return false;
        }
        match self.last_change_at {
            Some(last) => now_ms.saturating_sub(last) >= self.interval_ms,
            None => true,
        }
    }

    pub fn mark_saved(&mut self, now_ms: u64) {
        self.dirty = false;
        self.last_save_at = Some(now_ms);
    }

    pub fn last_save_at(&self) -> Option<u64> {
        self.last_save_at
    }

    /// Drop the pending deadline without saving.
    pub fn cancel(&mut self) {
        self.dirty = false;
        self.last_change_at = None;
    }
}

impl Default for PersistSchedule {
    fn default() -> Self {
        Self::new(DEFAULT_PERSIST_INTERVAL_MS)
    }
}

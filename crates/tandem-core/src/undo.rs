//! Session-local undo/redo over full board snapshots.
//!
//! Never shared with peers: undoing re-applies an old snapshot through the
//! store like any other edit, and that edit is what peers receive.

use std::collections::VecDeque;

use crate::element::Element;

/// Maximum number of undo states to keep.
pub const MAX_UNDO_HISTORY: usize = 100;

/// Bounded undo stack plus redo stack of element snapshots.
#[derive(Debug)]
pub struct UndoRedoStack {
    undo_stack: VecDeque<Vec<Element>>,
    redo_stack: Vec<Vec<Element>>,
    capacity: usize,
    /// Set while an undo/redo snapshot is being applied.
    applying: bool,
}

impl UndoRedoStack {
    pub fn new() -> Self {
        Self::with_capacity(MAX_UNDO_HISTORY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            capacity: capacity.max(1),
            applying: false,
        }
    }

    /// Push a copy of the current state (call before making changes).
    ///
    /// Suppressed while an undo/redo is being applied, so applying a
    /// snapshot never records itself. Returns whether a snapshot was pushed.
    pub fn save(&mut self, current: &[Element]) -> bool {
        if self.applying {
            return false;
        }
        self.undo_stack.push_back(current.to_vec());
        self.redo_stack.clear();
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
        true
    }

    /// Pop the state to restore for an undo, parking `current` for redo.
    pub fn take_undo(&mut self, current: Vec<Element>) -> Option<Vec<Element>> {
        let snapshot = self.undo_stack.pop_back()?;
        self.redo_stack.push(current);
        Some(snapshot)
    }

    /// Pop the state to restore for a redo, parking `current` for undo.
    pub fn take_redo(&mut self, current: Vec<Element>) -> Option<Vec<Element>> {
        let snapshot = self.redo_stack.pop()?;
        self.undo_stack.push_back(current);
        while self.undo_stack.len() > self.capacity {
            self.undo_stack.pop_front();
        }
        Some(snapshot)
    }

    /// Enter the re-entrancy guard around applying a snapshot.
    pub fn begin_apply(&mut self) {
        self.applying = true;
    }

    pub fn end_apply(&mut self) {
        self.applying = false;
    }

    pub fn is_applying(&self) -> bool {
        self.applying
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
    }
}

impl Default for UndoRedoStack {
    fn default() -> Self {
        Self::new()
    }
}

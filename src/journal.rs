/// Maximum undo depth per room; the oldest snapshot is discarded on overflow.
pub const HISTORY_CAP: usize = 50;

/// Bounded undo/redo journal of whole-state snapshots (serialized
/// `RoomState` strings). Storing full snapshots instead of inverse
/// operations keeps undo correct across event-schema changes at a bounded
/// memory cost.
#[derive(Debug, Default)]
pub struct Journal {
    history: Vec<String>,
    future: Vec<String>,
}

impl Journal {
    pub fn new() -> Self {
        Journal::default()
    }

    /// Record a snapshot taken just before a material mutation. Clears the
    /// redo stack: once you diverge, the old future is gone.
    pub fn push(&mut self, snapshot: String) {
        self.history.push(snapshot);
        if self.history.len() > HISTORY_CAP {
            let excess = self.history.len() - HISTORY_CAP;
            self.history.drain(..excess);
        }
        self.future.clear();
    }

    /// Step back: the current state moves to the redo stack and the most
    /// recent snapshot is returned. `None` when there is nothing to undo.
    pub fn undo(&mut self, current: String) -> Option<String> {
        let previous = self.history.pop()?;
        self.future.push(current);
        Some(previous)
    }

    /// Step forward again after an undo. `None` when there is nothing to redo.
    pub fn redo(&mut self, current: String) -> Option<String> {
        let next = self.future.pop()?;
        self.history.push(current);
        Some(next)
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.future.clear();
    }

    pub fn depth(&self) -> usize {
        self.history.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.future.len()
    }
}

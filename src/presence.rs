use std::collections::HashMap;

/// Per-room presence: concurrent session counts per client identity. The
/// same user can be connected from several tabs; they appear once in the
/// presence list until the last tab goes away.
#[derive(Debug, Default)]
pub struct Presence {
    counts: HashMap<String, usize>,
}

impl Presence {
    pub fn new() -> Self {
        Presence::default()
    }

    /// Register one more connection for `client_id`. Returns true if this
    /// is their first live connection (a new face in the room).
    pub fn incr(&mut self, client_id: &str) -> bool {
        let count = self.counts.entry(client_id.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop one connection for `client_id`. Returns true when that was their
    /// last one and the identity left the room entirely.
    pub fn decr(&mut self, client_id: &str) -> bool {
        if let Some(count) = self.counts.get_mut(client_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.counts.remove(client_id);
                return true;
            }
        }
        false
    }

    /// Sorted distinct client identities currently in the room.
    pub fn clients(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.counts.keys().cloned().collect();
        clients.sort();
        clients
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

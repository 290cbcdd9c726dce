use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{BinderError, Result};
use crate::lock;
use crate::Completion;

/// In-flight two-way transactions of one client connection.
///
/// Ids come from a counter starting at 1. Zero is never issued (it marks
/// oneway frames) and ids still in flight are skipped after wraparound.
#[derive(Debug)]
pub struct PendingTable {
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    next_id: u32,
    entries: HashMap<u32, Completion>,
    closed: bool,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(next_id: u32) -> Self {
        Self {
            state: Mutex::new(State {
                next_id,
                entries: HashMap::new(),
                closed: false,
            }),
        }
    }

    /// Allocate an id for `completion` and record it.
    pub fn insert(&self, completion: Completion) -> Result<u32> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(BinderError::Connection("connection closed".to_string()));
        }
        if state.entries.len() >= (u32::MAX - 1) as usize {
            return Err(BinderError::Connection(
                "too many pending transactions".to_string(),
            ));
        }
        let id = loop {
            let candidate = state.next_id;
            state.next_id = candidate.wrapping_add(1);
            if candidate != 0 && !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        state.entries.insert(id, completion);
        Ok(id)
    }

    /// Remove and return the entry for `id`.
    pub fn take(&self, id: u32) -> Option<Completion> {
        lock(&self.state).entries.remove(&id)
    }

    /// Remove the entry for `id` only if it still holds `completion`.
    pub fn remove_if(&self, id: u32, completion: &Completion) -> bool {
        let mut state = lock(&self.state);
        match state.entries.get(&id) {
            Some(existing) if existing.ptr_eq(completion) => {
                state.entries.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Refuse further inserts and hand back every remaining entry.
    pub fn drain(&self) -> Vec<Completion> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.entries.drain().map(|(_, completion)| completion).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

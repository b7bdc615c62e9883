//! # Change Queue
//!
//! The ordered, durable log of mutations the remote has not acknowledged.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Change Queue lifecycle                               │
//! │                                                                         │
//! │  update(path, v)                                                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  enqueue(event) ──► persisted under `pendingChanges`                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  drain() ──► sorted COPY, ascending timestamp (queue untouched)        │
//! │       │                                                                 │
//! │       ▼  for each event, after the remote acknowledged it              │
//! │  dequeue(event.id) ──► persisted                                       │
//! │                                                                         │
//! │  An event leaves the queue only through dequeue(id), i.e. only         │
//! │  after the remote accepted it.                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tracing::debug;

use pharma_core::SyncEvent;

use crate::local_state::LocalState;

/// Pending events, persisted on every mutation.
#[derive(Debug)]
pub struct ChangeQueue {
    entries: Vec<SyncEvent>,
    state: LocalState,
}

impl ChangeQueue {
    /// Restores whatever was queued when the process last stopped.
    pub fn load(state: LocalState) -> Self {
        let entries = state.pending_changes();
        if !entries.is_empty() {
            debug!(pending = entries.len(), "Restored pending changes");
        }
        Self { entries, state }
    }

    /// Appends an event. Returns false if an event with the same id is
    /// already queued.
    pub fn enqueue(&mut self, event: SyncEvent) -> bool {
        if self.contains(&event.id) {
            debug!(event_id = %event.id, "Event already queued");
            return false;
        }
        debug!(event_id = %event.id, path = %event.path, "Queued change");
        self.entries.push(event);
        self.persist();
        true
    }

    /// Removes the event with `event_id`. Unknown ids are a no-op.
    pub fn dequeue(&mut self, event_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != event_id);
        let removed = self.entries.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    /// A copy of the queue in ascending timestamp order. Events with equal
    /// timestamps keep their enqueue order.
    pub fn drain(&self) -> Vec<SyncEvent> {
        let mut events = self.entries.clone();
        events.sort_by_key(|e| e.timestamp);
        events
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.entries.iter().any(|e| e.id == event_id)
    }

    /// True if any queued event targets `path`.
    pub fn has_pending_for(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.timestamp).min()
    }

    /// Newest queued stamp. New local edits must not sort before it.
    pub fn newest_timestamp(&self) -> Option<i64> {
        self.entries.iter().map(|e| e.timestamp).max()
    }

    fn persist(&self) {
        self.state.set_pending_changes(&self.entries);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

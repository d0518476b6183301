//! Offline change queues.
//!
//! Changes saved during an offline session wait here until check-in. Unlike
//! the session cache, a queue store never evicts: a queue leaves only when
//! it is drained or its session ends.

use crate::error::EngineResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use tillsync_protocol::SyncChange;

/// Storage for per-session change queues.
pub trait OfflineQueueStore: Send + Sync {
    /// Queued changes of a session, oldest first. Empty if none.
    fn load(&self, session_id: &str) -> EngineResult<Vec<SyncChange>>;

    /// Replaces the queue of a session.
    fn store(&self, session_id: &str, changes: Vec<SyncChange>) -> EngineResult<()>;

    /// Removes and returns the queue of a session.
    fn take(&self, session_id: &str) -> EngineResult<Vec<SyncChange>>;
}

/// In-memory queue store.
#[derive(Debug, Default)]
pub struct MemoryOfflineQueueStore {
    queues: RwLock<HashMap<String, Vec<SyncChange>>>,
}

impl MemoryOfflineQueueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with a queue.
    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    /// Returns true if no session has a queue.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OfflineQueueStore for MemoryOfflineQueueStore {
    fn load(&self, session_id: &str) -> EngineResult<Vec<SyncChange>> {
        Ok(self
            .queues
            .read()
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    fn store(&self, session_id: &str, changes: Vec<SyncChange>) -> EngineResult<()> {
        let mut queues = self.queues.write();
        if changes.is_empty() {
            queues.remove(session_id);
        } else {
            queues.insert(session_id.to_string(), changes);
        }
        Ok(())
    }

    fn take(&self, session_id: &str) -> EngineResult<Vec<SyncChange>> {
        Ok(self.queues.write().remove(session_id).unwrap_or_default())
    }
}

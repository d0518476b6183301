//! Record of applied change ids.
//!
//! The applier consults the ledger before every write so a change id is
//! written and audited once. The in-memory ledger is bounded: once it holds
//! `capacity` ids the least recently used ones are dropped, and a replay of a
//! dropped id falls back to conflict detection against the stored version.
//! Deployments that need an unbounded replay window plug in a persistent
//! [`AppliedLedger`].

use crate::error::EngineResult;
use moka::sync::Cache;

/// Default number of change ids kept by [`MemoryLedger`].
pub const DEFAULT_LEDGER_CAPACITY: u64 = 100_000;

/// Storage for applied change ids.
pub trait AppliedLedger: Send + Sync {
    /// Highest version applied under a change id.
    fn applied_version(&self, change_id: &str) -> EngineResult<Option<u64>>;

    /// Records a write. Keeps the higher version when the id is known.
    fn record(&self, change_id: &str, version: u64) -> EngineResult<()>;
}

/// Bounded in-memory ledger backed by `moka`.
pub struct MemoryLedger {
    entries: Cache<String, u64>,
    capacity: u64,
}

impl MemoryLedger {
    /// Creates a ledger holding at most `capacity` change ids.
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(capacity).build(),
            capacity,
        }
    }

    /// Maximum number of change ids kept.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Approximate number of change ids held.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    /// Returns true if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLedger")
            .field("capacity", &self.capacity)
            .field("entries", &self.entries.entry_count())
            .finish()
    }
}

impl AppliedLedger for MemoryLedger {
    fn applied_version(&self, change_id: &str) -> EngineResult<Option<u64>> {
        Ok(self.entries.get(change_id))
    }

    fn record(&self, change_id: &str, version: u64) -> EngineResult<()> {
        self.entries
            .entry(change_id.to_string())
            .and_upsert_with(|existing| existing.map_or(version, |e| e.into_value().max(version)));
        Ok(())
    }
}

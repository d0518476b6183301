//! Persisted batch history.

use crate::error::{EngineResult, SyncError};
use parking_lot::RwLock;
use std::collections::HashMap;
use tillsync_protocol::{StatsFilter, SyncBatch};

/// Storage for batches.
///
/// `modify` is the only way to change a stored batch; implementations run the
/// closure atomically with respect to other calls for the same batch.
pub trait BatchStore: Send + Sync {
    /// Stores a new batch. Fails with `InvalidState` if the id exists.
    fn insert(&self, batch: SyncBatch) -> EngineResult<()>;

    /// Fetches a batch.
    fn get(&self, batch_id: &str) -> EngineResult<Option<SyncBatch>>;

    /// Mutates a batch in place and returns the stored result.
    ///
    /// If `apply` fails nothing is written.
    fn modify(
        &self,
        batch_id: &str,
        apply: &mut dyn FnMut(&mut SyncBatch) -> EngineResult<()>,
    ) -> EngineResult<SyncBatch>;

    /// Batches matching a filter, oldest first.
    fn list(&self, filter: &StatsFilter) -> EngineResult<Vec<SyncBatch>>;
}

/// In-memory batch history.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    batches: RwLock<HashMap<String, SyncBatch>>,
}

impl MemoryBatchStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored batches.
    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matches(filter: &StatsFilter, batch: &SyncBatch) -> bool {
    filter
        .device_id
        .as_ref()
        .map_or(true, |d| *d == batch.device_id)
        && filter
            .branch_id
            .as_ref()
            .map_or(true, |b| batch.branch_id.as_ref() == Some(b))
        && filter.since.map_or(true, |s| batch.created_at >= s)
}

impl BatchStore for MemoryBatchStore {
    fn insert(&self, batch: SyncBatch) -> EngineResult<()> {
        let mut batches = self.batches.write();
        if batches.contains_key(&batch.batch_id) {
            return Err(SyncError::invalid_state(format!(
                "batch {} already exists",
                batch.batch_id
            )));
        }
        batches.insert(batch.batch_id.clone(), batch);
        Ok(())
    }

    fn get(&self, batch_id: &str) -> EngineResult<Option<SyncBatch>> {
        Ok(self.batches.read().get(batch_id).cloned())
    }

    fn modify(
        &self,
        batch_id: &str,
        apply: &mut dyn FnMut(&mut SyncBatch) -> EngineResult<()>,
    ) -> EngineResult<SyncBatch> {
        let mut batches = self.batches.write();
        let stored = batches
            .get_mut(batch_id)
            .ok_or_else(|| SyncError::not_found("batch", batch_id))?;
        let mut draft = stored.clone();
        apply(&mut draft)?;
        *stored = draft.clone();
        Ok(draft)
    }

    fn list(&self, filter: &StatsFilter) -> EngineResult<Vec<SyncBatch>> {
        let mut batches: Vec<SyncBatch> = self
            .batches
            .read()
            .values()
            .filter(|b| matches(filter, b))
            .cloned()
            .collect();
        batches.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.batch_id.cmp(&b.batch_id))
        });
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tillsync_protocol::{BatchStatus, SyncDirection, SyncType};

    fn make_batch(id: &str, device: &str, branch: Option<&str>, created_at: u64) -> SyncBatch {
        SyncBatch::new(
            id,
            device,
            branch.map(str::to_string),
            SyncType::Incremental,
            SyncDirection::Upload,
            Vec::new(),
            3,
            created_at,
        )
    }

    #[test]
    fn insert_rejects_duplicates() {
        let store = MemoryBatchStore::new();
        store.insert(make_batch("b1", "d1", None, 1)).unwrap();
        assert!(store.insert(make_batch("b1", "d1", None, 2)).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn failed_modify_writes_nothing() {
        let store = MemoryBatchStore::new();
        store.insert(make_batch("b1", "d1", None, 1)).unwrap();

        let result = store.modify("b1", &mut |b| {
            b.status = BatchStatus::Processing;
            Err(SyncError::invalid_state("nope"))
        });
        assert!(result.is_err());
        assert_eq!(store.get("b1").unwrap().unwrap().status, BatchStatus::Pending);

        let updated = store
            .modify("b1", &mut |b| {
                b.status = BatchStatus::Processing;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.status, BatchStatus::Processing);
    }

    #[test]
    fn modify_unknown_batch_is_not_found() {
        let store = MemoryBatchStore::new();
        let err = store.modify("nope", &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, SyncError::NotFound { kind: "batch", .. }));
    }

    #[test]
    fn list_applies_filter_in_creation_order() {
        let store = MemoryBatchStore::new();
        store.insert(make_batch("b2", "d1", Some("north"), 20)).unwrap();
        store.insert(make_batch("b1", "d1", None, 10)).unwrap();
        store.insert(make_batch("b3", "d2", Some("north"), 30)).unwrap();

        let all = store.list(&StatsFilter::default()).unwrap();
        let ids: Vec<_> = all.iter().map(|b| b.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3"]);

        let d1 = store.list(&StatsFilter::for_device("d1")).unwrap();
        assert_eq!(d1.len(), 2);

        let north_recent = store
            .list(&StatsFilter {
                branch_id: Some("north".into()),
                since: Some(25),
                ..StatsFilter::default()
            })
            .unwrap();
        assert_eq!(north_recent.len(), 1);
        assert_eq!(north_recent[0].batch_id, "b3");
    }
}

//! Entity repositories and the entity registry.
//!
//! The engine never knows the shape of a business entity. It reads and writes
//! opaque payloads through [`EntityRepository`], looked up by entity type in a
//! closed [`EntityRegistry`] built once at startup.

use crate::error::{EngineResult, SyncError};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tillsync_protocol::{Operation, Payload};
use tracing::debug;

/// Narrows reads to the records visible to a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeFilter {
    /// Branch to scope to. Records without a branch are global and always
    /// visible.
    pub branch_id: Option<String>,
}

impl ScopeFilter {
    /// No scoping.
    pub fn all() -> Self {
        Self::default()
    }

    /// Scope to a branch.
    pub fn branch(branch_id: Option<&str>) -> Self {
        Self {
            branch_id: branch_id.map(str::to_string),
        }
    }

    /// Returns true if a record owned by `record_branch` is visible.
    pub fn admits(&self, record_branch: Option<&str>) -> bool {
        match (&self.branch_id, record_branch) {
            (Some(scope), Some(owner)) => scope == owner,
            _ => true,
        }
    }
}

/// A record as held by a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Entity id.
    pub entity_id: String,
    /// Payload. Last known payload for tombstones.
    pub data: Payload,
    /// Version of the last write.
    pub version: u64,
    /// First write time (store clock).
    pub created_at: u64,
    /// Write stamp of the last write.
    pub updated_at: u64,
    /// True if the record was deleted.
    pub deleted: bool,
    /// Owning branch.
    pub branch_id: Option<String>,
}

/// A write handed to a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    /// Mutation kind.
    pub operation: Operation,
    /// Target id. Repositories assign one for creates without it.
    pub entity_id: Option<String>,
    /// Payload. Updates are merged field by field onto the stored payload.
    pub data: Payload,
    /// Version to record.
    pub version: u64,
    /// Owning branch for new records.
    pub branch_id: Option<String>,
    /// Write stamp. Engine writes take it from the
    /// [`WriteSequence`](crate::WriteSequence), so it is unique across
    /// repositories.
    pub timestamp: u64,
}

/// Storage for one entity type.
pub trait EntityRepository: Send + Sync {
    /// Fetches a record, including tombstones.
    fn get(&self, entity_id: &str) -> EngineResult<Option<StoredRecord>>;

    /// Records written after `since` (all when `None`), oldest first.
    fn find_changed(
        &self,
        since: Option<u64>,
        scope: &ScopeFilter,
        limit: usize,
    ) -> EngineResult<Vec<StoredRecord>>;

    /// Applies a write and returns the stored record.
    fn apply(&self, request: WriteRequest) -> EngineResult<StoredRecord>;
}

/// In-memory repository.
///
/// Records keep the stamp of the write request as `updated_at`.
#[derive(Debug)]
pub struct MemoryRepository {
    entity: String,
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryRepository {
    /// Creates an empty repository for an entity type.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of records, including tombstones.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the repository holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn failure(&self, message: impl Into<String>) -> SyncError {
        SyncError::apply_failure(&self.entity, message)
    }
}

impl EntityRepository for MemoryRepository {
    fn get(&self, entity_id: &str) -> EngineResult<Option<StoredRecord>> {
        Ok(self.records.read().get(entity_id).cloned())
    }

    fn find_changed(
        &self,
        since: Option<u64>,
        scope: &ScopeFilter,
        limit: usize,
    ) -> EngineResult<Vec<StoredRecord>> {
        let records = self.records.read();
        let mut changed: Vec<StoredRecord> = records
            .values()
            .filter(|r| since.map_or(true, |s| r.updated_at > s))
            .filter(|r| scope.admits(r.branch_id.as_deref()))
            .cloned()
            .collect();
        changed.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        changed.truncate(limit);
        Ok(changed)
    }

    fn apply(&self, request: WriteRequest) -> EngineResult<StoredRecord> {
        let mut records = self.records.write();
        let stamp = request.timestamp;

        let record = match request.operation {
            Operation::Create | Operation::Update => {
                let Payload::Object(incoming) = request.data else {
                    return Err(self.failure("payload must be an object"));
                };
                let entity_id = request
                    .entity_id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let existing = records.get(&entity_id);

                let data = match (request.operation, existing) {
                    (Operation::Update, Some(prev)) if !prev.deleted => {
                        let mut merged = prev.data.as_object().cloned().unwrap_or_default();
                        merged.extend(incoming);
                        Payload::Object(merged)
                    }
                    _ => Payload::Object(incoming),
                };

                StoredRecord {
                    created_at: existing.map_or(stamp, |r| r.created_at),
                    version: existing.map_or(request.version, |r| r.version.max(request.version)),
                    branch_id: existing
                        .and_then(|r| r.branch_id.clone())
                        .or(request.branch_id),
                    entity_id,
                    data,
                    updated_at: stamp,
                    deleted: false,
                }
            }
            Operation::Delete => {
                let entity_id = request
                    .entity_id
                    .ok_or_else(|| self.failure("delete requires an entity id"))?;
                let existing = records.get(&entity_id);
                StoredRecord {
                    data: existing.map_or(Payload::Null, |r| r.data.clone()),
                    created_at: existing.map_or(stamp, |r| r.created_at),
                    version: existing.map_or(request.version, |r| r.version.max(request.version)),
                    branch_id: existing
                        .and_then(|r| r.branch_id.clone())
                        .or(request.branch_id),
                    entity_id,
                    updated_at: stamp,
                    deleted: true,
                }
            }
        };

        debug!(
            entity = %self.entity,
            entity_id = %record.entity_id,
            version = record.version,
            deleted = record.deleted,
            "record written"
        );
        records.insert(record.entity_id.clone(), record.clone());
        Ok(record)
    }
}

/// Closed mapping from entity type to repository.
#[derive(Clone, Default)]
pub struct EntityRegistry {
    repositories: BTreeMap<String, Arc<dyn EntityRepository>>,
}

impl EntityRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a repository, replacing any previous one for the type.
    pub fn register(&mut self, entity: impl Into<String>, repository: Arc<dyn EntityRepository>) {
        self.repositories.insert(entity.into(), repository);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, entity: impl Into<String>, repository: Arc<dyn EntityRepository>) -> Self {
        self.register(entity, repository);
        self
    }

    /// Looks up the repository of an entity type.
    pub fn get(&self, entity: &str) -> EngineResult<&Arc<dyn EntityRepository>> {
        self.repositories
            .get(entity)
            .ok_or_else(|| SyncError::not_found("entity type", entity))
    }

    /// Returns true if the entity type is registered.
    pub fn contains(&self, entity: &str) -> bool {
        self.repositories.contains_key(entity)
    }

    /// Registered entity types in sorted order.
    pub fn entity_types(&self) -> Vec<String> {
        self.repositories.keys().cloned().collect()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

impl std::fmt::Debug for EntityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_types", &self.entity_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(op: Operation, id: Option<&str>, data: Payload, version: u64, ts: u64) -> WriteRequest {
        WriteRequest {
            operation: op,
            entity_id: id.map(str::to_string),
            data,
            version,
            branch_id: None,
            timestamp: ts,
        }
    }

    #[test]
    fn create_assigns_missing_id() {
        let repo = MemoryRepository::new("products");
        let record = repo
            .apply(write(Operation::Create, None, json!({"name": "Tea"}), 1, 10))
            .unwrap();
        assert!(!record.entity_id.is_empty());
        assert_eq!(repo.get(&record.entity_id).unwrap(), Some(record));
    }

    #[test]
    fn update_merges_fields() {
        let repo = MemoryRepository::new("products");
        repo.apply(write(
            Operation::Create,
            Some("p1"),
            json!({"name": "Tea", "price": 300}),
            1,
            10,
        ))
        .unwrap();
        let record = repo
            .apply(write(Operation::Update, Some("p1"), json!({"price": 350}), 2, 20))
            .unwrap();
        assert_eq!(record.data, json!({"name": "Tea", "price": 350}));
        assert_eq!(record.version, 2);
        assert_eq!(record.created_at, 10);
    }

    #[test]
    fn delete_leaves_tombstone() {
        let repo = MemoryRepository::new("products");
        repo.apply(write(Operation::Create, Some("p1"), json!({"name": "Tea"}), 1, 10))
            .unwrap();
        let record = repo
            .apply(write(Operation::Delete, Some("p1"), Payload::Null, 2, 20))
            .unwrap();
        assert!(record.deleted);
        assert_eq!(record.data, json!({"name": "Tea"}));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let repo = MemoryRepository::new("products");
        let err = repo
            .apply(write(Operation::Create, Some("p1"), json!("Tea"), 1, 10))
            .unwrap_err();
        assert!(matches!(err, SyncError::ApplyFailure { .. }));
        assert!(repo.is_empty());
    }

    #[test]
    fn records_keep_the_request_stamp() {
        let repo = MemoryRepository::new("products");
        let a = repo
            .apply(write(Operation::Create, Some("a"), json!({}), 1, 10))
            .unwrap();
        let b = repo
            .apply(write(Operation::Create, Some("b"), json!({}), 1, 11))
            .unwrap();
        assert_eq!((a.updated_at, b.updated_at), (10, 11));

        let changed = repo.find_changed(Some(a.updated_at), &ScopeFilter::all(), 10).unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].entity_id, "b");
    }

    #[test]
    fn scope_filter_keeps_global_records() {
        let repo = MemoryRepository::new("products");
        let mut own = write(Operation::Create, Some("a"), json!({}), 1, 10);
        own.branch_id = Some("north".into());
        let mut other = write(Operation::Create, Some("b"), json!({}), 1, 11);
        other.branch_id = Some("south".into());
        repo.apply(own).unwrap();
        repo.apply(other).unwrap();
        repo.apply(write(Operation::Create, Some("c"), json!({}), 1, 12))
            .unwrap();

        let north = repo
            .find_changed(None, &ScopeFilter::branch(Some("north")), 10)
            .unwrap();
        let ids: Vec<_> = north.iter().map(|r| r.entity_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn registry_rejects_unknown_types() {
        let registry = EntityRegistry::new().with("products", Arc::new(MemoryRepository::new("products")));
        assert!(registry.contains("products"));
        assert!(matches!(
            registry.get("widgets"),
            Err(SyncError::NotFound { kind: "entity type", .. })
        ));
        assert_eq!(registry.entity_types(), vec!["products".to_string()]);
    }
}

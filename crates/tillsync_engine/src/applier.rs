//! The single write path into the entity repositories.
//!
//! Device changes, conflict resolutions and direct writes by server-side
//! business modules all go through [`ChangeApplier::apply`], so every write
//! is deduplicated by change id and audited exactly once.
//!
//! Writers to the same record are serialized on a striped lock keyed by
//! `entity:id`. Callers that detect conflicts take the lock with
//! [`ChangeApplier::lock_target`] first, then read, decide and write through
//! [`ChangeApplier::apply_locked`] while holding it.

use crate::audit::{AuditCategory, AuditEntry, AuditSink, AUDIT_MODULE};
use crate::clock::Clock;
use crate::error::{EngineResult, SyncError};
use crate::ledger::{AppliedLedger, MemoryLedger};
use crate::sequence::WriteSequence;
use crate::store::{EntityRegistry, StoredRecord, WriteRequest};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tillsync_protocol::{AppliedChange, Operation, Payload, SyncChange};
use tracing::{debug, trace};

/// Number of record lock stripes.
const TARGET_STRIPES: usize = 64;

/// Who is writing, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyContext {
    /// Device that sent the change.
    pub device_id: Option<String>,
    /// Branch that owns new records.
    pub branch_id: Option<String>,
    /// Audit category.
    pub category: AuditCategory,
}

impl ApplyContext {
    /// Context for a change from a device batch.
    pub fn device(device_id: &str, branch_id: Option<&str>) -> Self {
        Self {
            device_id: Some(device_id.to_string()),
            branch_id: branch_id.map(str::to_string),
            category: AuditCategory::SyncApply,
        }
    }

    /// Context for a direct server-side write.
    pub fn direct(branch_id: Option<&str>) -> Self {
        Self {
            device_id: None,
            branch_id: branch_id.map(str::to_string),
            category: AuditCategory::DirectWrite,
        }
    }

    /// Same context with another audit category.
    pub fn with_category(mut self, category: AuditCategory) -> Self {
        self.category = category;
        self
    }
}

/// Result of an apply call.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The store was written.
    Applied(StoredRecord),
    /// The change id was already applied at this version or newer.
    Duplicate,
}

impl ApplyOutcome {
    /// Returns true if the store was written.
    pub fn was_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied(_))
    }
}

/// Exclusive hold on the lock stripe of one record.
///
/// Released on drop.
#[must_use = "the record is unlocked as soon as the guard is dropped"]
pub struct TargetGuard<'a> {
    _stripe: MutexGuard<'a, ()>,
}

impl std::fmt::Debug for TargetGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetGuard").finish_non_exhaustive()
    }
}

/// Applies changes idempotently and audits them.
pub struct ChangeApplier {
    registry: Arc<EntityRegistry>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
    sequence: Arc<WriteSequence>,
    ledger: Arc<dyn AppliedLedger>,
    targets: Vec<Mutex<()>>,
    applied: AtomicU64,
    duplicates: AtomicU64,
}

impl ChangeApplier {
    /// Creates an applier with a bounded in-memory ledger.
    pub fn new(registry: Arc<EntityRegistry>, audit: Arc<dyn AuditSink>, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            audit,
            sequence: Arc::new(WriteSequence::new(clock.clone())),
            clock,
            ledger: Arc::new(MemoryLedger::default()),
            targets: (0..TARGET_STRIPES).map(|_| Mutex::new(())).collect(),
            applied: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Uses another ledger for applied change ids.
    pub fn with_ledger(mut self, ledger: Arc<dyn AppliedLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Entity registry written through.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Sequence stamping every write.
    pub fn sequence(&self) -> &Arc<WriteSequence> {
        &self.sequence
    }

    /// Locks the record a change targets.
    ///
    /// Creates without an id lock a stripe of the entity type. The lock is
    /// not reentrant: use [`apply_locked`](Self::apply_locked) while holding
    /// it.
    pub fn lock_target(&self, entity: &str, entity_id: Option<&str>) -> TargetGuard<'_> {
        let mut hasher = DefaultHasher::new();
        entity.hash(&mut hasher);
        entity_id.hash(&mut hasher);
        let stripe = (hasher.finish() % TARGET_STRIPES as u64) as usize;
        TargetGuard {
            _stripe: self.targets[stripe].lock(),
        }
    }

    /// Returns true if the change id was applied at this version or newer.
    pub fn is_applied(&self, change: &SyncChange) -> EngineResult<bool> {
        Ok(self
            .ledger
            .applied_version(&change.id)?
            .is_some_and(|version| change.version <= version))
    }

    /// Record currently stored for a change's target.
    ///
    /// Fails with `NotFound` for unregistered entity types.
    pub fn current(&self, entity: &str, entity_id: Option<&str>) -> EngineResult<Option<StoredRecord>> {
        let repository = self.registry.get(entity)?;
        match entity_id {
            Some(id) => repository.get(id),
            None => Ok(None),
        }
    }

    /// Writes a change to its repository and audits it.
    ///
    /// Conflict detection is the caller's job; this only deduplicates.
    pub fn apply(&self, change: &SyncChange, ctx: &ApplyContext) -> EngineResult<ApplyOutcome> {
        let target = self.lock_target(&change.entity, change.entity_id.as_deref());
        self.apply_locked(change, ctx, &target)
    }

    /// [`apply`](Self::apply) for a caller already holding the target lock.
    pub fn apply_locked(
        &self,
        change: &SyncChange,
        ctx: &ApplyContext,
        _target: &TargetGuard<'_>,
    ) -> EngineResult<ApplyOutcome> {
        if self.is_applied(change)? {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(change_id = %change.id, "change already applied, skipping");
            return Ok(ApplyOutcome::Duplicate);
        }

        let repository = self.registry.get(&change.entity)?;
        let previous = match change.entity_id.as_deref() {
            Some(id) => repository.get(id)?,
            None => None,
        };

        let record = self.sequence.commit(|stamp| {
            repository.apply(WriteRequest {
                operation: change.operation,
                entity_id: change.entity_id.clone(),
                data: change.data.clone(),
                version: change.version,
                branch_id: ctx.branch_id.clone(),
                timestamp: stamp,
            })
        })?;

        self.ledger.record(&change.id, change.version)?;
        self.applied.fetch_add(1, Ordering::Relaxed);

        self.audit.log(AuditEntry {
            action: change.operation,
            entity: change.entity.clone(),
            entity_id: record.entity_id.clone(),
            old_values: previous.filter(|p| !p.deleted).map(|p| p.data),
            new_values: (!record.deleted).then(|| record.data.clone()),
            module: AUDIT_MODULE,
            category: ctx.category,
            device_id: ctx.device_id.clone(),
            change_id: change.id.clone(),
            version: record.version,
            timestamp: record.updated_at,
        })?;

        trace!(
            change_id = %change.id,
            entity = %change.entity,
            entity_id = %record.entity_id,
            operation = %change.operation,
            "change applied"
        );
        Ok(ApplyOutcome::Applied(record))
    }

    /// Writes on behalf of a server-side business module.
    ///
    /// The version is one past the stored version so the write never loses
    /// to what it replaces.
    pub fn apply_direct(
        &self,
        entity: &str,
        operation: Operation,
        entity_id: Option<&str>,
        data: Payload,
        branch_id: Option<&str>,
    ) -> EngineResult<StoredRecord> {
        let target = self.lock_target(entity, entity_id);
        let current = self.current(entity, entity_id)?;
        let version = current.map_or(1, |r| r.version + 1);
        let change = SyncChange::new(entity, entity_id.map(str::to_string), operation, data, version)
            .with_timestamp(self.clock.now_millis());

        match self.apply_locked(&change, &ApplyContext::direct(branch_id), &target)? {
            ApplyOutcome::Applied(record) => Ok(record),
            // Fresh change ids are never in the ledger.
            ApplyOutcome::Duplicate => Err(SyncError::invalid_state(format!(
                "direct write {} reported as duplicate",
                change.id
            ))),
        }
    }

    /// Number of writes performed.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Number of duplicate applies skipped.
    pub fn duplicate_count(&self) -> u64 {
        self.duplicates.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for ChangeApplier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeApplier")
            .field("registry", &self.registry)
            .field("sequence", &self.sequence)
            .field("applied", &self.applied_count())
            .field("duplicates", &self.duplicate_count())
            .finish()
    }
}

/// Broadcast summary of a written change.
pub fn applied_change(change: &SyncChange, record: &StoredRecord) -> AppliedChange {
    AppliedChange {
        change_id: change.id.clone(),
        entity: change.entity.clone(),
        entity_id: record.entity_id.clone(),
        operation: change.operation,
        data: if record.deleted {
            Payload::Null
        } else {
            record.data.clone()
        },
        version: record.version,
        origin_user_id: change.origin_user_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::clock::ManualClock;
    use crate::store::{EntityRepository, MemoryRepository};
    use serde_json::json;
    use std::sync::Barrier;
    use std::thread;

    struct Fixture {
        applier: ChangeApplier,
        products: Arc<MemoryRepository>,
        customers: Arc<MemoryRepository>,
        audit: Arc<MemoryAuditLog>,
    }

    fn make_fixture() -> Fixture {
        let products = Arc::new(MemoryRepository::new("products"));
        let customers = Arc::new(MemoryRepository::new("customers"));
        let registry = Arc::new(
            EntityRegistry::new()
                .with("products", products.clone())
                .with("customers", customers.clone()),
        );
        let audit = Arc::new(MemoryAuditLog::new());
        let applier = ChangeApplier::new(registry, audit.clone(), Arc::new(ManualClock::new(1_000)));
        Fixture {
            applier,
            products,
            customers,
            audit,
        }
    }

    #[test]
    fn apply_writes_and_audits_once() {
        let f = make_fixture();
        let change = SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1);
        let ctx = ApplyContext::device("till-1", None);

        assert!(f.applier.apply(&change, &ctx).unwrap().was_applied());
        assert_eq!(f.applier.apply(&change, &ctx).unwrap(), ApplyOutcome::Duplicate);

        assert_eq!(f.audit.len(), 1);
        assert_eq!(f.products.len(), 1);
        assert_eq!(f.applier.duplicate_count(), 1);

        let entry = &f.audit.entries()[0];
        assert_eq!(entry.device_id.as_deref(), Some("till-1"));
        assert_eq!(entry.category, AuditCategory::SyncApply);
        assert!(entry.old_values.is_none());
    }

    #[test]
    fn newer_version_of_same_change_id_is_applied() {
        let f = make_fixture();
        let ctx = ApplyContext::device("till-1", None);
        let change = SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1)
            .with_id("c1");
        f.applier.apply(&change, &ctx).unwrap();

        let mut bumped = change.clone();
        bumped.version = 2;
        assert!(f.applier.apply(&bumped, &ctx).unwrap().was_applied());
        assert_eq!(f.audit.len(), 2);
    }

    #[test]
    fn unknown_entity_is_not_found() {
        let f = make_fixture();
        let change = SyncChange::create("widgets", None, json!({}), 1);
        let err = f
            .applier
            .apply(&change, &ApplyContext::direct(None))
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound { .. }));
        assert!(f.audit.is_empty());
    }

    #[test]
    fn failed_write_is_not_recorded() {
        let f = make_fixture();
        let change = SyncChange::create("products", Some("p1".into()), json!([1, 2]), 1);
        let ctx = ApplyContext::device("till-1", None);
        assert!(f.applier.apply(&change, &ctx).is_err());
        assert!(!f.applier.is_applied(&change).unwrap());
        assert!(f.audit.is_empty());
    }

    #[test]
    fn direct_writes_bump_version_and_audit() {
        let f = make_fixture();
        let first = f
            .applier
            .apply_direct("products", Operation::Create, Some("p1"), json!({"price": 1}), None)
            .unwrap();
        let second = f
            .applier
            .apply_direct("products", Operation::Update, Some("p1"), json!({"price": 2}), None)
            .unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        let entries = f.audit.entries_for("products", "p1");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].category, AuditCategory::DirectWrite);
        assert_eq!(entries[1].old_values, Some(json!({"price": 1})));
        assert_eq!(f.products.get("p1").unwrap().unwrap().data, json!({"price": 2}));
    }

    #[test]
    fn applied_change_hides_tombstone_payload() {
        let f = make_fixture();
        let ctx = ApplyContext::device("till-1", None);
        f.applier
            .apply(
                &SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1),
                &ctx,
            )
            .unwrap();
        let delete = SyncChange::delete("products", "p1", 2);
        let ApplyOutcome::Applied(record) = f.applier.apply(&delete, &ctx).unwrap() else {
            panic!("expected a write");
        };
        let summary = applied_change(&delete, &record);
        assert!(summary.data.is_null());
        assert_eq!(summary.operation, Operation::Delete);
    }

    #[test]
    fn stamps_are_unique_across_entity_types() {
        let f = make_fixture();
        let ctx = ApplyContext::device("till-1", None);
        for id in ["p1", "p2"] {
            f.applier
                .apply(&SyncChange::create("products", Some(id.into()), json!({}), 1), &ctx)
                .unwrap();
        }
        f.applier
            .apply(&SyncChange::create("customers", Some("c1".into()), json!({}), 1), &ctx)
            .unwrap();

        let stamp = |repo: &MemoryRepository, id: &str| repo.get(id).unwrap().unwrap().updated_at;
        assert_eq!(stamp(&f.products, "p1"), 1_000);
        assert_eq!(stamp(&f.products, "p2"), 1_001);
        assert_eq!(stamp(&f.customers, "c1"), 1_002);
        assert_eq!(f.applier.sequence().committed(), 1_002);
    }

    #[test]
    fn parallel_applies_of_one_change_write_once() {
        let f = Arc::new(make_fixture());
        let change = SyncChange::update("products", "p1", json!({"price": 400}), 2).with_id("c1");
        let start = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let f = f.clone();
                let change = change.clone();
                let start = start.clone();
                thread::spawn(move || {
                    start.wait();
                    f.applier
                        .apply(&change, &ApplyContext::device("till-1", None))
                        .unwrap()
                        .was_applied()
                })
            })
            .collect();
        let writes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count();

        assert_eq!(writes, 1);
        assert_eq!(f.audit.len(), 1);
        assert_eq!(f.applier.duplicate_count(), 3);
    }

    #[test]
    fn shared_ledger_survives_a_new_applier() {
        let f = make_fixture();
        let ledger: Arc<dyn AppliedLedger> = Arc::new(MemoryLedger::new(1_000));
        let first = ChangeApplier::new(
            f.applier.registry().clone(),
            f.audit.clone(),
            Arc::new(ManualClock::new(1_000)),
        )
        .with_ledger(ledger.clone());
        let change = SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1);
        first.apply(&change, &ApplyContext::direct(None)).unwrap();

        let second = ChangeApplier::new(
            f.applier.registry().clone(),
            f.audit.clone(),
            Arc::new(ManualClock::new(2_000)),
        )
        .with_ledger(ledger);
        assert!(second.is_applied(&change).unwrap());
        assert_eq!(
            second.apply(&change, &ApplyContext::direct(None)).unwrap(),
            ApplyOutcome::Duplicate
        );
        assert_eq!(f.audit.len(), 1);
    }
}

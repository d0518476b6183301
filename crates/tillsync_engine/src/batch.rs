//! Batch lifecycle management.
//!
//! A batch moves through:
//!
//! ```text
//! pending -> processing -> completed
//!                       -> failed     -> pending (retry_batch)
//!                       -> conflicted -> completed (refresh_status)
//! ```
//!
//! Changes are processed sequentially in submission order. A failing change
//! never stops its siblings, and a conflict is recorded on the batch instead
//! of being written.

use crate::applier::{applied_change, ApplyContext, ApplyOutcome, ChangeApplier, TargetGuard};
use crate::audit::AuditCategory;
use crate::clock::Clock;
use crate::conflict::{ConflictDetector, Detection};
use crate::error::{EngineResult, SyncError};
use crate::history::BatchStore;
use crate::stats::StatsCollector;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tillsync_protocol::{
    AppliedChange, BatchStatus, ConflictResolution, Operation, Payload, RecordError,
    RecordErrorKind, StatsFilter, SyncBatch, SyncChange, SyncConflict, SyncDirection, SyncResult,
    SyncStats, SyncType, UploadRequest,
};
use tracing::{debug, info, warn};

/// Cooperative cancellation signal, checked between changes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parameters of a new batch.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBatch {
    /// Uploading device.
    pub device_id: String,
    /// Branch scope.
    pub branch_id: Option<String>,
    /// Sync scope.
    pub sync_type: SyncType,
    /// Sync direction.
    pub direction: SyncDirection,
    /// Changes in submission order.
    pub changes: Vec<SyncChange>,
    /// Free-form device metadata.
    pub metadata: Option<Payload>,
}

impl NewBatch {
    /// An upload of changes from a device.
    pub fn upload(device_id: impl Into<String>, changes: Vec<SyncChange>) -> Self {
        Self {
            device_id: device_id.into(),
            branch_id: None,
            sync_type: SyncType::ChangesOnly,
            direction: SyncDirection::Upload,
            changes,
            metadata: None,
        }
    }

    /// Sets the branch scope.
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
}

impl From<UploadRequest> for NewBatch {
    fn from(request: UploadRequest) -> Self {
        Self {
            device_id: request.device_id,
            branch_id: request.branch_id,
            sync_type: request.sync_type,
            direction: request.direction,
            changes: request.changes,
            metadata: request.metadata,
        }
    }
}

/// A settled conflict and the write it caused, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict {
    /// The conflict as stored after resolution.
    pub conflict: SyncConflict,
    /// Store write made by the resolution. `None` for `local`.
    pub applied: Option<AppliedChange>,
}

#[derive(Default)]
struct Tally {
    processed: u32,
    failed: u32,
    conflicted: u32,
    errors: Vec<RecordError>,
    applied: Vec<AppliedChange>,
}

impl Tally {
    fn fail(&mut self, change: &SyncChange, kind: RecordErrorKind, message: impl Into<String>) {
        self.failed += 1;
        self.errors.push(RecordError::new(change, kind, message));
    }
}

/// Creates, processes, retries and settles batches.
pub struct BatchManager {
    store: Arc<dyn BatchStore>,
    applier: Arc<ChangeApplier>,
    detector: ConflictDetector,
    stats: StatsCollector,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    /// Serializes status checks that are followed by store writes.
    transitions: Mutex<()>,
}

impl BatchManager {
    /// Creates a manager.
    pub fn new(
        store: Arc<dyn BatchStore>,
        applier: Arc<ChangeApplier>,
        detector: ConflictDetector,
        stats: StatsCollector,
        clock: Arc<dyn Clock>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            applier,
            detector,
            stats,
            clock,
            max_retries,
            transitions: Mutex::new(()),
        }
    }

    /// The applier used for writes.
    pub fn applier(&self) -> &Arc<ChangeApplier> {
        &self.applier
    }

    /// The conflict detector.
    pub fn detector(&self) -> &ConflictDetector {
        &self.detector
    }

    /// Records a new pending batch.
    ///
    /// Fails with `InvalidRequest` on an empty device id or a malformed
    /// change. Unknown entity types are reported per record at processing
    /// time.
    pub fn create_batch(&self, new: NewBatch) -> EngineResult<SyncBatch> {
        if new.device_id.trim().is_empty() {
            return Err(SyncError::InvalidRequest("device id must not be empty".into()));
        }
        for change in &new.changes {
            change
                .validate()
                .map_err(|e| SyncError::InvalidRequest(e.to_string()))?;
        }

        let now = self.clock.now_millis();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let batch_id = format!("batch-{}-{}-{}", new.device_id, now, &suffix[..8]);

        let mut batch = SyncBatch::new(
            batch_id,
            new.device_id,
            new.branch_id,
            new.sync_type,
            new.direction,
            new.changes,
            self.max_retries,
            now,
        );
        batch.metadata = new.metadata;
        self.store.insert(batch.clone())?;

        info!(
            batch_id = %batch.batch_id,
            device_id = %batch.device_id,
            records = batch.total_records,
            "batch created"
        );
        Ok(batch)
    }

    /// Fetches a batch.
    pub fn get_batch(&self, batch_id: &str) -> EngineResult<SyncBatch> {
        self.store
            .get(batch_id)?
            .ok_or_else(|| SyncError::not_found("batch", batch_id))
    }

    /// Batches matching a filter, oldest first.
    pub fn list_batches(&self, filter: &StatsFilter) -> EngineResult<Vec<SyncBatch>> {
        self.store.list(filter)
    }

    /// Moves a pending batch to `processing`.
    pub fn start_processing(&self, batch_id: &str) -> EngineResult<SyncBatch> {
        let _guard = self.transitions.lock();
        let now = self.clock.now_millis();
        self.store.modify(batch_id, &mut |batch| {
            if !batch.status.can_transition_to(BatchStatus::Processing) {
                return Err(SyncError::invalid_state(format!(
                    "batch {} is {}, expected pending",
                    batch.batch_id, batch.status
                )));
            }
            batch.status = BatchStatus::Processing;
            batch.started_at = Some(now);
            batch.completed_at = None;
            batch.processing_ms = None;
            Ok(())
        })
    }

    /// Processes a pending batch to a settled status.
    pub fn process_batch(&self, batch_id: &str) -> EngineResult<SyncResult> {
        self.start_processing(batch_id)?;
        self.execute(batch_id, &CancelFlag::new())
    }

    /// Applies the changes of a batch already in `processing`.
    ///
    /// Stops between changes once `cancel` is set; the remaining changes fail
    /// with `Cancelled`.
    pub fn execute(&self, batch_id: &str, cancel: &CancelFlag) -> EngineResult<SyncResult> {
        let batch = self.get_batch(batch_id)?;
        if batch.status != BatchStatus::Processing {
            return Err(SyncError::invalid_state(format!(
                "batch {batch_id} is {}, expected processing",
                batch.status
            )));
        }

        let started = Instant::now();
        let ctx = ApplyContext::device(&batch.device_id, batch.branch_id.as_deref());
        let mut conflicts = batch.conflicts.clone();
        let mut tally = Tally::default();

        for (index, change) in batch.changes.iter().enumerate() {
            if cancel.is_cancelled() {
                for rest in &batch.changes[index..] {
                    tally.fail(rest, RecordErrorKind::Cancelled, SyncError::Cancelled.to_string());
                }
                warn!(batch_id, remaining = batch.changes.len() - index, "batch cancelled");
                break;
            }
            self.process_change(&batch, change, &ctx, &mut conflicts, &mut tally);
        }

        let now = self.clock.now_millis();
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let applied = std::mem::take(&mut tally.applied);

        let stored = {
            let _guard = self.transitions.lock();
            self.store.modify(batch_id, &mut |b| {
                b.processed_records = tally.processed;
                b.failed_records = tally.failed;
                b.conflicted_records = tally.conflicted;
                b.conflicts = conflicts.clone();
                b.errors = tally.errors.clone();
                b.status = b.settled_status();
                b.completed_at = Some(now);
                b.processing_ms = Some(elapsed);
                Ok(())
            })?
        };

        info!(
            batch_id,
            status = %stored.status,
            processed = stored.processed_records,
            failed = stored.failed_records,
            conflicted = stored.conflicted_records,
            elapsed_ms = elapsed,
            "batch processed"
        );
        Ok(SyncResult::from_batch(&stored).with_applied(applied))
    }

    /// Checks and writes one change.
    ///
    /// The target record stays locked from the duplicate check to the write,
    /// so a concurrent writer cannot slip in between detection and apply.
    fn process_change(
        &self,
        batch: &SyncBatch,
        change: &SyncChange,
        ctx: &ApplyContext,
        conflicts: &mut Vec<SyncConflict>,
        tally: &mut Tally,
    ) {
        let previous = conflicts.iter().position(|c| c.change_id == change.id);
        if previous.is_some_and(|i| conflicts[i].is_resolved()) {
            tally.processed += 1;
            return;
        }

        let target = self
            .applier
            .lock_target(&change.entity, change.entity_id.as_deref());
        let checked = self.applier.is_applied(change).and_then(|applied| {
            if applied {
                Ok(None)
            } else {
                self.applier
                    .current(&change.entity, change.entity_id.as_deref())
                    .map(Some)
            }
        });
        let current = match checked {
            Ok(Some(current)) => current,
            Ok(None) => {
                debug!(change_id = %change.id, "change already applied");
                if let Some(i) = previous {
                    self.close_cleared(&mut conflicts[i]);
                }
                tally.processed += 1;
                return;
            }
            Err(e) => {
                tally.fail(change, e.record_kind(), e.to_string());
                return;
            }
        };

        match self.detector.detect(change, current.as_ref()) {
            Detection::Clear => match self.applier.apply_locked(change, ctx, &target) {
                Ok(outcome) => {
                    if let ApplyOutcome::Applied(record) = outcome {
                        tally.applied.push(applied_change(change, &record));
                    }
                    if let Some(i) = previous {
                        self.close_cleared(&mut conflicts[i]);
                    }
                    tally.processed += 1;
                }
                Err(e) => {
                    warn!(change_id = %change.id, error = %e, "change failed");
                    tally.fail(change, e.record_kind(), e.to_string());
                }
            },
            Detection::Conflict {
                conflict_type,
                differing_fields,
            } => {
                let now = self.clock.now_millis();
                let mut conflict = self.detector.build_conflict(
                    change,
                    current.as_ref(),
                    conflict_type,
                    differing_fields,
                    now,
                );
                if let Some(i) = previous {
                    conflict.id = conflicts[i].id.clone();
                }

                if let Some(resolution) = self.detector.policy().resolution_for(&conflict) {
                    match self.write_resolution(batch, &conflict, resolution, None, &target) {
                        Ok(applied) => {
                            conflict.resolve(resolution, None, now);
                            tally.applied.extend(applied);
                        }
                        Err(e) => {
                            warn!(
                                conflict_id = %conflict.id,
                                error = %e,
                                "automatic resolution failed, leaving conflict open"
                            );
                        }
                    }
                }

                debug!(
                    change_id = %change.id,
                    conflict_type = ?conflict.conflict_type,
                    resolved = conflict.is_resolved(),
                    "conflict detected"
                );
                tally.conflicted += 1;
                match previous {
                    Some(i) => conflicts[i] = conflict,
                    None => conflicts.push(conflict),
                }
            }
        }
    }

    /// Closes a conflict from an earlier attempt whose change has now been
    /// written. The incoming side won, so it is recorded as `remote`.
    fn close_cleared(&self, conflict: &mut SyncConflict) {
        conflict.resolve(ConflictResolution::Remote, None, self.clock.now_millis());
        debug!(
            conflict_id = %conflict.id,
            change_id = %conflict.change_id,
            "conflict cleared on retry"
        );
    }

    /// Writes the outcome of a resolution through the applier.
    ///
    /// The caller holds the lock of the conflict's record.
    fn write_resolution(
        &self,
        batch: &SyncBatch,
        conflict: &SyncConflict,
        resolution: ConflictResolution,
        resolved_data: Option<&Payload>,
        target: &TargetGuard<'_>,
    ) -> EngineResult<Option<AppliedChange>> {
        let remote_data = || conflict.remote_version.data.clone().unwrap_or(Payload::Null);

        let (operation, data) = match resolution {
            ConflictResolution::Local => return Ok(None),
            ConflictResolution::Remote => (conflict.operation, remote_data()),
            ConflictResolution::Merge | ConflictResolution::Manual => match resolved_data {
                Some(data) if conflict.local_version.deleted => (Operation::Create, data.clone()),
                Some(data) => (Operation::Update, data.clone()),
                None => (conflict.operation, remote_data()),
            },
        };

        let stored_version = self
            .applier
            .current(&conflict.entity, conflict.entity_id.as_deref())?
            .map_or(0, |r| r.version);
        let mut change = SyncChange::new(
            conflict.entity.clone(),
            conflict.entity_id.clone(),
            operation,
            data,
            conflict.resolution_version(stored_version),
        )
        .with_id(format!("resolve:{}", conflict.id))
        .with_timestamp(self.clock.now_millis());
        change.origin_user_id = conflict.origin_user_id.clone();

        let ctx = ApplyContext::device(&batch.device_id, batch.branch_id.as_deref())
            .with_category(AuditCategory::ConflictResolution);
        match self.applier.apply_locked(&change, &ctx, target)? {
            ApplyOutcome::Applied(record) => Ok(Some(applied_change(&change, &record))),
            ApplyOutcome::Duplicate => Ok(None),
        }
    }

    /// Settles one conflict.
    ///
    /// `local` keeps the stored value. `remote` writes the incoming value.
    /// `merge` and `manual` write `resolved_data`, or the incoming value when
    /// none is given. The batch status is left alone; see
    /// [`refresh_status`](Self::refresh_status).
    pub fn resolve_conflict(
        &self,
        batch_id: &str,
        conflict_id: &str,
        resolution: ConflictResolution,
        resolved_data: Option<Payload>,
    ) -> EngineResult<ResolvedConflict> {
        let _guard = self.transitions.lock();
        let batch = self.get_batch(batch_id)?;
        if batch.status == BatchStatus::Processing {
            return Err(SyncError::invalid_state(format!(
                "batch {batch_id} is being processed"
            )));
        }
        let conflict = batch
            .conflict(conflict_id)
            .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
        if conflict.is_resolved() {
            return Err(SyncError::invalid_state(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }

        let resolved_data = resolved_data.filter(|_| resolution.accepts_data());
        let applied = {
            let target = self
                .applier
                .lock_target(&conflict.entity, conflict.entity_id.as_deref());
            self.write_resolution(&batch, conflict, resolution, resolved_data.as_ref(), &target)?
        };

        let now = self.clock.now_millis();
        let stored = self.store.modify(batch_id, &mut |b| {
            let conflict = b
                .conflict_mut(conflict_id)
                .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
            conflict.resolve(resolution, resolved_data.clone(), now);
            Ok(())
        })?;

        let conflict = stored
            .conflict(conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::not_found("conflict", conflict_id))?;
        info!(
            batch_id,
            conflict_id,
            resolution = ?resolution,
            remaining = stored.unresolved_conflicts().count(),
            "conflict resolved"
        );
        Ok(ResolvedConflict { conflict, applied })
    }

    /// Settles a batch left in `processing` when its run could not finish.
    ///
    /// Every change fails with `kind` and `message`; changes already written
    /// are picked up as duplicates when the batch is retried. Fails with
    /// `InvalidState` unless the batch is processing.
    pub fn abandon(
        &self,
        batch_id: &str,
        kind: RecordErrorKind,
        message: &str,
    ) -> EngineResult<SyncBatch> {
        let _guard = self.transitions.lock();
        let now = self.clock.now_millis();
        let stored = self.store.modify(batch_id, &mut |batch| {
            if batch.status != BatchStatus::Processing {
                return Err(SyncError::invalid_state(format!(
                    "batch {} is {}, expected processing",
                    batch.batch_id, batch.status
                )));
            }
            batch.errors = batch
                .changes
                .iter()
                .map(|change| RecordError::new(change, kind, message))
                .collect();
            batch.processed_records = 0;
            batch.conflicted_records = 0;
            batch.failed_records = batch.total_records;
            batch.status = batch.settled_status();
            batch.completed_at = Some(now);
            batch.processing_ms = batch.started_at.map(|s| now.saturating_sub(s));
            Ok(())
        })?;

        warn!(batch_id, kind = ?kind, reason = message, status = %stored.status, "batch abandoned");
        Ok(stored)
    }

    /// Moves a `conflicted` batch with no open conflicts to `completed`.
    ///
    /// Other batches are returned unchanged.
    pub fn refresh_status(&self, batch_id: &str) -> EngineResult<SyncBatch> {
        let _guard = self.transitions.lock();
        let now = self.clock.now_millis();
        self.store.modify(batch_id, &mut |batch| {
            if batch.status == BatchStatus::Conflicted && !batch.has_unresolved_conflicts() {
                batch.status = BatchStatus::Completed;
                batch.completed_at = Some(now);
                info!(batch_id = %batch.batch_id, "conflicted batch completed");
            }
            Ok(())
        })
    }

    /// Resets a failed batch to `pending` for another attempt.
    ///
    /// Fails with `RetryExhausted` at the cap and `InvalidState` unless the
    /// batch failed. Neither failure changes the batch.
    pub fn prepare_retry(&self, batch_id: &str) -> EngineResult<SyncBatch> {
        let _guard = self.transitions.lock();
        self.store.modify(batch_id, &mut |batch| {
            if batch.status != BatchStatus::Failed {
                return Err(SyncError::invalid_state(format!(
                    "batch {} is {}, only failed batches can be retried",
                    batch.batch_id, batch.status
                )));
            }
            if batch.retry_count >= batch.max_retries {
                return Err(SyncError::RetryExhausted {
                    batch_id: batch.batch_id.clone(),
                    max_retries: batch.max_retries,
                });
            }
            batch.retry_count += 1;
            batch.processed_records = 0;
            batch.failed_records = 0;
            batch.conflicted_records = 0;
            batch.errors.clear();
            batch.status = BatchStatus::Pending;
            batch.started_at = None;
            batch.completed_at = None;
            batch.processing_ms = None;
            Ok(())
        })
    }

    /// Retries a failed batch and processes it again.
    pub fn retry_batch(&self, batch_id: &str) -> EngineResult<SyncResult> {
        let batch = self.prepare_retry(batch_id)?;
        info!(batch_id, attempt = batch.retry_count, "retrying batch");
        self.process_batch(batch_id)
    }

    /// Aggregate statistics for a filter.
    pub fn get_stats(&self, filter: &StatsFilter) -> EngineResult<SyncStats> {
        self.stats.get(filter)
    }
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("max_retries", &self.max_retries)
            .field("policy", &self.detector.policy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::config::ConflictConfig;
    use crate::history::MemoryBatchStore;
    use crate::store::{
        EntityRegistry, EntityRepository, MemoryRepository, ScopeFilter, StoredRecord, WriteRequest,
    };
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tillsync_protocol::{ConflictPolicy, ConflictType};

    /// Rejects the first `failures` writes.
    struct FlakyRepository {
        inner: MemoryRepository,
        failures: AtomicU32,
    }

    impl EntityRepository for FlakyRepository {
        fn get(&self, entity_id: &str) -> EngineResult<Option<StoredRecord>> {
            self.inner.get(entity_id)
        }

        fn find_changed(
            &self,
            since: Option<u64>,
            scope: &ScopeFilter,
            limit: usize,
        ) -> EngineResult<Vec<StoredRecord>> {
            self.inner.find_changed(since, scope, limit)
        }

        fn apply(&self, request: WriteRequest) -> EngineResult<StoredRecord> {
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(SyncError::apply_failure("orders", "disk full"));
            }
            self.inner.apply(request)
        }
    }

    /// Stalls the first read after [`arm`](Self::arm) and reports it.
    struct PausingRepository {
        inner: MemoryRepository,
        gate: Mutex<Option<mpsc::Sender<()>>>,
    }

    impl PausingRepository {
        fn new(entity: &str) -> Self {
            Self {
                inner: MemoryRepository::new(entity),
                gate: Mutex::new(None),
            }
        }

        fn arm(&self) -> mpsc::Receiver<()> {
            let (tx, rx) = mpsc::channel();
            *self.gate.lock() = Some(tx);
            rx
        }
    }

    impl EntityRepository for PausingRepository {
        fn get(&self, entity_id: &str) -> EngineResult<Option<StoredRecord>> {
            let armed = self.gate.lock().take();
            if let Some(tx) = armed {
                tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(100));
            }
            self.inner.get(entity_id)
        }

        fn find_changed(
            &self,
            since: Option<u64>,
            scope: &ScopeFilter,
            limit: usize,
        ) -> EngineResult<Vec<StoredRecord>> {
            self.inner.find_changed(since, scope, limit)
        }

        fn apply(&self, request: WriteRequest) -> EngineResult<StoredRecord> {
            self.inner.apply(request)
        }
    }

    struct Fixture {
        manager: BatchManager,
        products: Arc<MemoryRepository>,
        audit: Arc<MemoryAuditLog>,
    }

    fn make_manager(registry: EntityRegistry, policy: ConflictPolicy) -> (BatchManager, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10_000));
        let applier = Arc::new(ChangeApplier::new(Arc::new(registry), audit.clone(), clock.clone()));
        let store: Arc<dyn BatchStore> = Arc::new(MemoryBatchStore::new());
        let stats = StatsCollector::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            clock.clone(),
            Duration::from_secs(30),
        );
        let manager = BatchManager::new(
            store,
            applier,
            ConflictDetector::new(ConflictConfig::new().with_policy(policy)),
            stats,
            clock,
            2,
        );
        (manager, audit)
    }

    fn make_fixture_with(policy: ConflictPolicy, order_failures: u32) -> Fixture {
        let products = Arc::new(MemoryRepository::new("products"));
        let orders = Arc::new(FlakyRepository {
            inner: MemoryRepository::new("orders"),
            failures: AtomicU32::new(order_failures),
        });
        let registry = EntityRegistry::new()
            .with("products", products.clone())
            .with("orders", orders);
        let (manager, audit) = make_manager(registry, policy);
        Fixture {
            manager,
            products,
            audit,
        }
    }

    fn make_paused_manager() -> (Arc<BatchManager>, Arc<PausingRepository>, Arc<MemoryAuditLog>) {
        let products = Arc::new(PausingRepository::new("products"));
        let (manager, audit) = make_manager(
            EntityRegistry::new().with("products", products.clone()),
            ConflictPolicy::Manual,
        );
        manager
            .applier()
            .apply(
                &SyncChange::create("products", Some("p1".into()), json!({"name": "Tea", "price": 300}), 6),
                &ApplyContext::direct(None),
            )
            .unwrap();
        (Arc::new(manager), products, audit)
    }

    fn make_fixture() -> Fixture {
        make_fixture_with(ConflictPolicy::Manual, 0)
    }

    fn seed_product(f: &Fixture, id: &str, version: u64, data: Payload) {
        f.manager
            .applier()
            .apply(
                &SyncChange::create("products", Some(id.into()), data, version),
                &ApplyContext::direct(None),
            )
            .unwrap();
    }

    #[test]
    fn create_batch_validates_structure() {
        let f = make_fixture();
        let err = f
            .manager
            .create_batch(NewBatch::upload(" ", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));

        let bad = SyncChange::update("products", "p1", json!({}), 1).with_id("");
        let err = f
            .manager
            .create_batch(NewBatch::upload("till-1", vec![bad]))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));

        let batch = f
            .manager
            .create_batch(
                NewBatch::upload("till-1", vec![SyncChange::create("widgets", None, json!({}), 1)])
                    .with_branch("north"),
            )
            .unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.total_records, 1);
        assert!(batch.batch_id.starts_with("batch-till-1-10000-"));
    }

    #[test]
    fn process_applies_in_order_and_audits() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1),
                    SyncChange::update("products", "p1", json!({"price": 300}), 2),
                ],
            ))
            .unwrap();

        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.processed_records, 2);
        assert_eq!(result.applied.len(), 2);
        assert_eq!(f.audit.len(), 2);
        assert_eq!(
            f.products.get("p1").unwrap().unwrap().data,
            json!({"name": "Tea", "price": 300})
        );

        let stored = f.manager.get_batch(&batch.batch_id).unwrap();
        assert!(stored.is_balanced());
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn unknown_entity_fails_record_but_not_siblings() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::create("widgets", Some("w1".into()), json!({}), 1),
                    SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1),
                ],
            ))
            .unwrap();

        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.failed_records, 1);
        assert_eq!(result.processed_records, 1);
        assert_eq!(result.errors[0].kind, RecordErrorKind::NotFound);
        assert_eq!(f.products.len(), 1);
    }

    #[test]
    fn process_requires_pending() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload("till-1", Vec::new()))
            .unwrap();
        f.manager.process_batch(&batch.batch_id).unwrap();
        let err = f.manager.process_batch(&batch.batch_id).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
        assert!(matches!(
            f.manager.process_batch("nope").unwrap_err(),
            SyncError::NotFound { .. }
        ));
    }

    #[test]
    fn conflict_keeps_batch_conflicted_until_resolved() {
        let f = make_fixture();
        seed_product(&f, "p1", 5, json!({"name": "Tea", "price": 350}));

        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 400}), 3)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.status, BatchStatus::Conflicted);
        assert_eq!(result.conflicted_records, 1);
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Version);
        assert_eq!(f.products.get("p1").unwrap().unwrap().data["price"], json!(350));

        // Still conflicted before resolution.
        let same = f.manager.refresh_status(&batch.batch_id).unwrap();
        assert_eq!(same.status, BatchStatus::Conflicted);

        let conflict_id = result.conflicts[0].id.clone();
        let resolved = f
            .manager
            .resolve_conflict(&batch.batch_id, &conflict_id, ConflictResolution::Remote, None)
            .unwrap();
        assert!(resolved.conflict.is_resolved());
        assert_eq!(resolved.applied.as_ref().map(|a| a.version), Some(6));

        let record = f.products.get("p1").unwrap().unwrap();
        assert_eq!(record.data["price"], json!(400));
        assert_eq!(record.version, 6);

        // Resolution alone does not flip the batch.
        assert_eq!(
            f.manager.get_batch(&batch.batch_id).unwrap().status,
            BatchStatus::Conflicted
        );
        let done = f.manager.refresh_status(&batch.batch_id).unwrap();
        assert_eq!(done.status, BatchStatus::Completed);

        let err = f
            .manager
            .resolve_conflict(&batch.batch_id, &conflict_id, ConflictResolution::Local, None)
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }

    #[test]
    fn local_resolution_writes_nothing() {
        let f = make_fixture();
        seed_product(&f, "p1", 5, json!({"price": 350}));
        let audit_before = f.audit.len();

        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::delete("products", "p1", 2)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Deleted);

        let resolved = f
            .manager
            .resolve_conflict(
                &batch.batch_id,
                &result.conflicts[0].id,
                ConflictResolution::Local,
                Some(json!({"ignored": true})),
            )
            .unwrap();
        assert!(resolved.applied.is_none());
        assert!(resolved.conflict.resolved_data.is_none());
        assert_eq!(f.audit.len(), audit_before);
        assert!(!f.products.get("p1").unwrap().unwrap().deleted);
    }

    #[test]
    fn merge_resolution_writes_supplied_data() {
        let f = make_fixture();
        seed_product(&f, "p1", 5, json!({"name": "Tea", "price": 350}));

        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 400}), 5)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.conflicts[0].conflict_type, ConflictType::Data);
        assert_eq!(result.conflicts[0].differing_fields, vec!["price".to_string()]);

        f.manager
            .resolve_conflict(
                &batch.batch_id,
                &result.conflicts[0].id,
                ConflictResolution::Merge,
                Some(json!({"price": 375})),
            )
            .unwrap();
        let record = f.products.get("p1").unwrap().unwrap();
        assert_eq!(record.data, json!({"name": "Tea", "price": 375}));

        let entries = f.audit.entries_for("products", "p1");
        assert_eq!(
            entries.last().map(|e| e.category),
            Some(AuditCategory::ConflictResolution)
        );
    }

    #[test]
    fn resolve_unknown_ids_is_not_found() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload("till-1", Vec::new()))
            .unwrap();
        assert!(matches!(
            f.manager
                .resolve_conflict(&batch.batch_id, "c-nope", ConflictResolution::Local, None)
                .unwrap_err(),
            SyncError::NotFound { kind: "conflict", .. }
        ));
        assert!(matches!(
            f.manager
                .resolve_conflict("b-nope", "c-nope", ConflictResolution::Local, None)
                .unwrap_err(),
            SyncError::NotFound { kind: "batch", .. }
        ));
    }

    #[test]
    fn retry_replays_failed_changes_once() {
        let f = make_fixture_with(ConflictPolicy::Manual, 1);
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1),
                    SyncChange::create("orders", Some("o1".into()), json!({"total": 5}), 1),
                ],
            ))
            .unwrap();

        let first = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.errors[0].kind, RecordErrorKind::ApplyFailure);
        assert_eq!(f.audit.len(), 1);

        let second = f.manager.retry_batch(&batch.batch_id).unwrap();
        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.processed_records, 2);
        assert!(second.errors.is_empty());
        // The product was not written twice.
        assert_eq!(f.audit.len(), 2);
        assert_eq!(f.manager.get_batch(&batch.batch_id).unwrap().retry_count, 1);
    }

    #[test]
    fn retry_is_capped() {
        let f = make_fixture_with(ConflictPolicy::Manual, 10);
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::create("orders", Some("o1".into()), json!({}), 1)],
            ))
            .unwrap();
        f.manager.process_batch(&batch.batch_id).unwrap();
        f.manager.retry_batch(&batch.batch_id).unwrap();
        f.manager.retry_batch(&batch.batch_id).unwrap();

        let before = f.manager.get_batch(&batch.batch_id).unwrap();
        assert_eq!(before.retry_count, 2);
        let err = f.manager.retry_batch(&batch.batch_id).unwrap_err();
        assert!(matches!(err, SyncError::RetryExhausted { max_retries: 2, .. }));
        assert_eq!(f.manager.get_batch(&batch.batch_id).unwrap(), before);
    }

    #[test]
    fn retry_requires_failed() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload("till-1", Vec::new()))
            .unwrap();
        let err = f.manager.retry_batch(&batch.batch_id).unwrap_err();
        assert!(matches!(err, SyncError::InvalidState(_)));
    }

    #[test]
    fn retry_refreshes_open_conflict_in_place() {
        let f = make_fixture_with(ConflictPolicy::Manual, 1);
        seed_product(&f, "p1", 5, json!({"price": 350}));
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::update("products", "p1", json!({"price": 1}), 2),
                    SyncChange::create("orders", Some("o1".into()), json!({}), 1),
                ],
            ))
            .unwrap();
        let first = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        let conflict_id = first.conflicts[0].id.clone();

        let second = f.manager.retry_batch(&batch.batch_id).unwrap();
        assert_eq!(second.status, BatchStatus::Conflicted);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].id, conflict_id);
    }

    #[test]
    fn server_wins_policy_resolves_without_writing() {
        let f = make_fixture_with(ConflictPolicy::ServerWins, 0);
        seed_product(&f, "p1", 5, json!({"price": 350}));
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 1}), 2)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.conflicts[0].resolution, Some(ConflictResolution::Local));
        assert_eq!(f.products.get("p1").unwrap().unwrap().data["price"], json!(350));
    }

    #[test]
    fn client_wins_policy_writes_remote() {
        let f = make_fixture_with(ConflictPolicy::ClientWins, 0);
        seed_product(&f, "p1", 5, json!({"price": 350}));
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 1}), 2)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.applied.len(), 1);
        let record = f.products.get("p1").unwrap().unwrap();
        assert_eq!(record.data["price"], json!(1));
        assert_eq!(record.version, 6);
    }

    #[test]
    fn cancelled_changes_fail() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::create("products", Some("p1".into()), json!({}), 1),
                    SyncChange::create("products", Some("p2".into()), json!({}), 1),
                ],
            ))
            .unwrap();
        f.manager.start_processing(&batch.batch_id).unwrap();
        let cancel = CancelFlag::new();
        cancel.cancel();

        let result = f.manager.execute(&batch.batch_id, &cancel).unwrap();
        assert_eq!(result.status, BatchStatus::Failed);
        assert_eq!(result.failed_records, 2);
        assert!(result
            .errors
            .iter()
            .all(|e| e.kind == RecordErrorKind::Cancelled));
        assert!(f.products.is_empty());
    }

    #[test]
    fn stats_reflect_history() {
        let f = make_fixture();
        for _ in 0..2 {
            let batch = f
                .manager
                .create_batch(NewBatch::upload(
                    "till-1",
                    vec![SyncChange::create("products", None, json!({"name": "x"}), 1)],
                ))
                .unwrap();
            f.manager.process_batch(&batch.batch_id).unwrap();
        }
        let stats = f.manager.get_stats(&StatsFilter::for_device("till-1")).unwrap();
        assert_eq!(stats.total_batches, 2);
        assert_eq!(stats.completed_batches, 2);
        assert_eq!(stats.processed_records, 2);
        assert_eq!(
            f.manager.get_stats(&StatsFilter::for_device("till-9")).unwrap().total_batches,
            0
        );
    }

    #[test]
    fn concurrent_write_waits_for_batch_on_same_record() {
        let (manager, products, audit) = make_paused_manager();
        let batch = manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 400}), 7)],
            ))
            .unwrap();

        let paused = products.arm();
        let worker = {
            let manager = manager.clone();
            let batch_id = batch.batch_id.clone();
            thread::spawn(move || manager.process_batch(&batch_id).unwrap())
        };
        // The batch has read p1 and holds it.
        paused.recv().unwrap();
        let direct = manager
            .applier()
            .apply_direct("products", Operation::Update, Some("p1"), json!({"price": 500}), None)
            .unwrap();
        let result = worker.join().unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.applied[0].version, 7);
        assert_eq!(direct.version, 8);
        let record = products.get("p1").unwrap().unwrap();
        assert_eq!(record.data["price"], json!(500));

        let entries = audit.entries_for("products", "p1");
        let last_two: Vec<_> = entries[entries.len() - 2..]
            .iter()
            .map(|e| (e.category, e.old_values.clone()))
            .collect();
        assert_eq!(
            last_two,
            vec![
                (AuditCategory::SyncApply, Some(json!({"name": "Tea", "price": 300}))),
                (AuditCategory::DirectWrite, Some(json!({"name": "Tea", "price": 400}))),
            ]
        );
    }

    #[test]
    fn concurrent_batches_write_a_shared_change_once() {
        let (manager, products, audit) = make_paused_manager();
        let shared = SyncChange::update("products", "p1", json!({"price": 450}), 7).with_id("shared");
        let first = manager
            .create_batch(NewBatch::upload("till-1", vec![shared.clone()]))
            .unwrap();
        let second = manager
            .create_batch(NewBatch::upload("till-2", vec![shared]))
            .unwrap();

        let paused = products.arm();
        let worker = {
            let manager = manager.clone();
            let batch_id = first.batch_id.clone();
            thread::spawn(move || manager.process_batch(&batch_id).unwrap())
        };
        paused.recv().unwrap();
        let late = manager.process_batch(&second.batch_id).unwrap();
        let early = worker.join().unwrap();

        assert_eq!(early.applied.len(), 1);
        assert_eq!(late.status, BatchStatus::Completed);
        assert_eq!(late.processed_records, 1);
        assert!(late.applied.is_empty());
        let writes = audit
            .entries()
            .iter()
            .filter(|e| e.change_id == "shared")
            .count();
        assert_eq!(writes, 1);
    }

    #[test]
    fn retry_closes_conflict_that_no_longer_applies() {
        let f = make_fixture_with(ConflictPolicy::Manual, 1);
        let applier = f.manager.applier();
        applier
            .apply_direct("products", Operation::Create, Some("p1"), json!({"name": "Tea"}), None)
            .unwrap();
        applier
            .apply_direct("products", Operation::Delete, Some("p1"), Payload::Null, None)
            .unwrap();

        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::update("products", "p1", json!({"price": 9}), 10),
                    SyncChange::create("orders", Some("o1".into()), json!({"total": 5}), 1),
                ],
            ))
            .unwrap();
        let first = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(first.status, BatchStatus::Failed);
        assert_eq!(first.conflicts[0].conflict_type, ConflictType::Deleted);

        // p1 comes back before the retry, so the update no longer conflicts.
        applier
            .apply_direct("products", Operation::Create, Some("p1"), json!({"name": "Tea"}), None)
            .unwrap();
        let second = f.manager.retry_batch(&batch.batch_id).unwrap();

        assert_eq!(second.status, BatchStatus::Completed);
        assert_eq!(second.processed_records, 2);
        assert_eq!(second.conflicted_records, 0);
        assert_eq!(second.conflicts.len(), 1);
        assert_eq!(second.conflicts[0].id, first.conflicts[0].id);
        assert_eq!(second.conflicts[0].resolution, Some(ConflictResolution::Remote));
        assert!(second.conflicts[0].resolved_at.is_some());
        assert_eq!(f.products.get("p1").unwrap().unwrap().data["price"], json!(9));
    }

    #[test]
    fn resolution_outranks_writes_made_after_detection() {
        let f = make_fixture();
        seed_product(&f, "p1", 5, json!({"price": 350}));
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![SyncChange::update("products", "p1", json!({"price": 400}), 3)],
            ))
            .unwrap();
        let result = f.manager.process_batch(&batch.batch_id).unwrap();
        assert_eq!(result.conflicts[0].local_version.version, 5);

        f.manager
            .applier()
            .apply_direct("products", Operation::Update, Some("p1"), json!({"price": 360}), None)
            .unwrap();
        let resolved = f
            .manager
            .resolve_conflict(&batch.batch_id, &result.conflicts[0].id, ConflictResolution::Remote, None)
            .unwrap();

        assert_eq!(resolved.applied.map(|a| a.version), Some(7));
        let record = f.products.get("p1").unwrap().unwrap();
        assert_eq!(record.version, 7);
        assert_eq!(record.data["price"], json!(400));
    }

    #[test]
    fn abandoned_batch_fails_and_can_be_retried() {
        let f = make_fixture();
        let batch = f
            .manager
            .create_batch(NewBatch::upload(
                "till-1",
                vec![
                    SyncChange::create("products", Some("p1".into()), json!({}), 1),
                    SyncChange::create("products", Some("p2".into()), json!({}), 1),
                ],
            ))
            .unwrap();
        assert!(matches!(
            f.manager
                .abandon(&batch.batch_id, RecordErrorKind::Cancelled, "worker shut down")
                .unwrap_err(),
            SyncError::InvalidState(_)
        ));

        f.manager.start_processing(&batch.batch_id).unwrap();
        let abandoned = f
            .manager
            .abandon(&batch.batch_id, RecordErrorKind::Cancelled, "worker shut down")
            .unwrap();
        assert_eq!(abandoned.status, BatchStatus::Failed);
        assert_eq!(abandoned.failed_records, 2);
        assert!(abandoned.is_balanced());
        assert!(abandoned.completed_at.is_some());
        assert!(abandoned
            .errors
            .iter()
            .all(|e| e.kind == RecordErrorKind::Cancelled && e.message == "worker shut down"));

        let retried = f.manager.retry_batch(&batch.batch_id).unwrap();
        assert_eq!(retried.status, BatchStatus::Completed);
        assert_eq!(retried.processed_records, 2);
    }
}

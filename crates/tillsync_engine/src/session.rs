//! Offline sessions.
//!
//! A session lets a device work disconnected for a bounded window. Sessions
//! and their last package live in the [`KvCache`]:
//!
//! | key                     | value                    |
//! |-------------------------|--------------------------|
//! | `offline_session:{id}`  | [`OfflineSession`]       |
//! | `offline_device:{dev}`  | session ids of a device  |
//! | `offline_package:{id}`  | [`OfflineDataPackage`]   |
//! | `offline_sessions`      | every known session id   |
//!
//! Queued changes are work the device has already done, so they are kept in
//! an [`OfflineQueueStore`] instead, where capacity eviction cannot reach
//! them.
//!
//! Expiry is evaluated lazily against the engine clock. Cache TTLs only bound
//! how long entries are retained.

use crate::applier::ChangeApplier;
use crate::cache::{get_decoded, set_encoded, KvCache};
use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::conflict::{ConflictDetector, Detection};
use crate::error::{EngineResult, SyncError};
use crate::package::PackageBuilder;
use crate::queue::{MemoryOfflineQueueStore, OfflineQueueStore};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{
    Capability, CreateSessionRequest, DataSnapshot, OfflineDataPackage, OfflineSession,
    RecordError, RecordErrorKind, SaveChangesOutcome, SessionStatus, SyncChange,
};
use tracing::{debug, info, warn};

/// How long a session outlives its offline window in the cache.
pub const SESSION_RETENTION: Duration = Duration::from_secs(15 * 60);

const SESSION_INDEX_KEY: &str = "offline_sessions";

fn session_key(id: &str) -> String {
    format!("offline_session:{id}")
}

fn device_key(device_id: &str) -> String {
    format!("offline_device:{device_id}")
}

fn package_key(id: &str) -> String {
    format!("offline_package:{id}")
}

/// Parameters of a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    /// Device.
    pub device_id: String,
    /// User.
    pub user_id: String,
    /// Branch scope.
    pub branch_id: Option<String>,
    /// Capabilities. `None` grants read, write and sync.
    pub capabilities: Option<BTreeSet<Capability>>,
    /// Offline window. `None` uses the configured default.
    pub max_offline_hours: Option<u32>,
}

impl NewSession {
    /// A session with default capabilities and window.
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            branch_id: None,
            capabilities: None,
            max_offline_hours: None,
        }
    }

    /// Sets the branch scope.
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    /// Restricts the capabilities.
    pub fn with_capabilities<I: IntoIterator<Item = Capability>>(mut self, capabilities: I) -> Self {
        self.capabilities = Some(capabilities.into_iter().collect());
        self
    }

    /// Sets the offline window.
    pub fn with_max_offline_hours(mut self, hours: u32) -> Self {
        self.max_offline_hours = Some(hours);
        self
    }
}

impl From<CreateSessionRequest> for NewSession {
    fn from(request: CreateSessionRequest) -> Self {
        Self {
            device_id: request.device_id,
            user_id: request.user_id,
            branch_id: request.branch_id,
            capabilities: request.capabilities.map(|c| c.into_iter().collect()),
            max_offline_hours: request.max_offline_hours,
        }
    }
}

/// Manages offline sessions, their packages and their change queues.
pub struct OfflineSessionManager {
    cache: Arc<dyn KvCache>,
    queues: Arc<dyn OfflineQueueStore>,
    applier: Arc<ChangeApplier>,
    detector: ConflictDetector,
    packages: PackageBuilder,
    clock: Arc<dyn Clock>,
    config: OfflineConfig,
    /// Serializes read-modify-write cycles on cache entries.
    lock: Mutex<()>,
}

impl OfflineSessionManager {
    /// Creates a manager with an in-memory queue store.
    pub fn new(
        cache: Arc<dyn KvCache>,
        applier: Arc<ChangeApplier>,
        detector: ConflictDetector,
        packages: PackageBuilder,
        clock: Arc<dyn Clock>,
        config: OfflineConfig,
    ) -> Self {
        Self {
            cache,
            queues: Arc::new(MemoryOfflineQueueStore::new()),
            applier,
            detector,
            packages,
            clock,
            config,
            lock: Mutex::new(()),
        }
    }

    /// Uses another store for change queues.
    pub fn with_queue_store(mut self, queues: Arc<dyn OfflineQueueStore>) -> Self {
        self.queues = queues;
        self
    }

    fn retention(&self, session: &OfflineSession, now: u64) -> Duration {
        Duration::from_millis(session.expires_at().saturating_sub(now)) + SESSION_RETENTION
    }

    fn load(&self, id: &str) -> EngineResult<Option<OfflineSession>> {
        get_decoded(self.cache.as_ref(), &session_key(id))
    }

    fn store(&self, session: &OfflineSession, now: u64) -> EngineResult<()> {
        set_encoded(
            self.cache.as_ref(),
            &session_key(&session.id),
            session,
            Some(self.retention(session, now)),
        )
    }

    fn load_ids(&self, key: &str) -> EngineResult<Vec<String>> {
        Ok(get_decoded(self.cache.as_ref(), key)?.unwrap_or_default())
    }

    fn store_ids(&self, key: &str, ids: &[String]) -> EngineResult<()> {
        if ids.is_empty() {
            self.cache.delete(key);
            Ok(())
        } else {
            set_encoded(self.cache.as_ref(), key, &ids, None)
        }
    }

    /// Flips an elapsed active session to `expired`. Returns true if it did.
    fn expire_if_elapsed(&self, session: &mut OfflineSession, now: u64) -> EngineResult<bool> {
        if session.is_active() && session.is_expired_at(now) {
            session.status = SessionStatus::Expired;
            self.store(session, now)?;
            info!(
                session_id = %session.id,
                device_id = %session.device_id,
                "offline session expired"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Loads a session and applies the expiry check.
    fn load_current(&self, id: &str, now: u64) -> EngineResult<Option<OfflineSession>> {
        let Some(mut session) = self.load(id)? else {
            return Ok(None);
        };
        self.expire_if_elapsed(&mut session, now)?;
        Ok(Some(session))
    }

    fn require(&self, id: &str, capability: Capability, now: u64) -> EngineResult<OfflineSession> {
        let session = self
            .load_current(id, now)?
            .ok_or_else(|| SyncError::not_found("session", id))?;
        if !session.permits(capability, now) {
            return Err(SyncError::capability_denied(id, capability));
        }
        Ok(session)
    }

    /// Opens a session and indexes it under its device.
    pub fn create_session(&self, new: NewSession) -> EngineResult<OfflineSession> {
        if new.device_id.trim().is_empty() || new.user_id.trim().is_empty() {
            return Err(SyncError::InvalidRequest(
                "device id and user id are required".into(),
            ));
        }
        let hours = new
            .max_offline_hours
            .unwrap_or(self.config.default_max_offline_hours);
        if hours == 0 || hours > self.config.max_offline_hours_limit {
            return Err(SyncError::InvalidRequest(format!(
                "offline window must be between 1 and {} hours",
                self.config.max_offline_hours_limit
            )));
        }

        let _guard = self.lock.lock();
        let now = self.clock.now_millis();

        let base = format!("offline_{}_{}", new.device_id, now);
        let mut id = base.clone();
        let mut n = 1;
        while self.cache.get(&session_key(&id)).is_some() {
            id = format!("{base}_{n}");
            n += 1;
        }

        let session = OfflineSession {
            id,
            device_id: new.device_id,
            user_id: new.user_id,
            branch_id: new.branch_id,
            started_at: now,
            last_activity: now,
            status: SessionStatus::Active,
            capabilities: new.capabilities.unwrap_or_else(Capability::defaults),
            max_offline_hours: hours,
            data_snapshot: None,
        };
        self.store(&session, now)?;

        let key = device_key(&session.device_id);
        let mut device_ids = self.load_ids(&key)?;
        device_ids.push(session.id.clone());
        self.store_ids(&key, &device_ids)?;

        let mut all = self.load_ids(SESSION_INDEX_KEY)?;
        all.push(session.id.clone());
        self.store_ids(SESSION_INDEX_KEY, &all)?;

        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            hours,
            "offline session created"
        );
        Ok(session)
    }

    /// Fetches a session, applying the expiry check.
    pub fn get_session(&self, id: &str) -> EngineResult<OfflineSession> {
        let _guard = self.lock.lock();
        self.load_current(id, self.clock.now_millis())?
            .ok_or_else(|| SyncError::not_found("session", id))
    }

    /// Returns true if the session exists, is active and has not elapsed.
    pub fn validate_session(&self, id: &str) -> EngineResult<bool> {
        let _guard = self.lock.lock();
        let now = self.clock.now_millis();
        Ok(self
            .load_current(id, now)?
            .is_some_and(|s| s.is_active()))
    }

    /// Records device activity.
    ///
    /// Returns `None` if the session is gone.
    pub fn update_activity(&self, id: &str) -> EngineResult<Option<OfflineSession>> {
        let _guard = self.lock.lock();
        let now = self.clock.now_millis();
        let Some(mut session) = self.load(id)? else {
            debug!(session_id = id, "activity for unknown session");
            return Ok(None);
        };
        if !self.expire_if_elapsed(&mut session, now)? && session.is_active() {
            session.last_activity = now;
            self.store(&session, now)?;
        }
        Ok(Some(session))
    }

    /// Builds a data package and fingerprints it on the session.
    ///
    /// Requires an active session with `read`.
    pub fn create_data_package(
        &self,
        id: &str,
        entities: Option<&[String]>,
    ) -> EngineResult<OfflineDataPackage> {
        let _guard = self.lock.lock();
        let now = self.clock.now_millis();
        let mut session = self.require(id, Capability::Read, now)?;

        let package = self
            .packages
            .build(id, entities, session.branch_id.as_deref())?;

        session.data_snapshot = Some(DataSnapshot {
            timestamp: package.timestamp,
            checksum: package.metadata.checksum.clone(),
            entities: package.data.keys().cloned().collect(),
        });
        session.last_activity = now;
        self.store(&session, now)?;
        set_encoded(
            self.cache.as_ref(),
            &package_key(id),
            &package,
            Some(self.retention(&session, now)),
        )?;

        info!(
            session_id = id,
            entities = package.data.len(),
            bytes = package.metadata.data_size,
            "offline package built"
        );
        Ok(package)
    }

    /// Last package built for a session.
    pub fn get_package(&self, id: &str) -> EngineResult<Option<OfflineDataPackage>> {
        get_decoded(self.cache.as_ref(), &package_key(id))
    }

    /// Returns true if `checksum` matches the session's last package.
    pub fn verify_snapshot(&self, id: &str, checksum: &str) -> EngineResult<bool> {
        let session = self
            .load(id)?
            .ok_or_else(|| SyncError::not_found("session", id))?;
        Ok(session
            .data_snapshot
            .is_some_and(|snapshot| snapshot.checksum == checksum))
    }

    /// Queues changes made offline.
    ///
    /// Without an active session holding `write`, every item is rejected
    /// with `CapabilityDenied` and nothing is queued. Items that conflict with
    /// the store are reported and not queued.
    pub fn save_offline_changes(
        &self,
        id: &str,
        changes: Vec<SyncChange>,
    ) -> EngineResult<SaveChangesOutcome> {
        let _guard = self.lock.lock();
        let now = self.clock.now_millis();
        let mut session = self
            .load_current(id, now)?
            .ok_or_else(|| SyncError::not_found("session", id))?;

        let mut outcome = SaveChangesOutcome::default();
        if !session.permits(Capability::Write, now) {
            let reason = SyncError::capability_denied(id, Capability::Write).to_string();
            outcome.errors = changes
                .iter()
                .map(|c| RecordError::new(c, RecordErrorKind::CapabilityDenied, reason.clone()))
                .collect();
            warn!(session_id = id, rejected = changes.len(), "offline save denied");
            return Ok(outcome);
        }

        let mut queue = self.queues.load(id)?;

        for change in changes {
            if let Err(e) = change.validate() {
                outcome
                    .errors
                    .push(RecordError::new(&change, RecordErrorKind::InvalidChange, e.to_string()));
                continue;
            }
            let current = match self
                .applier
                .current(&change.entity, change.entity_id.as_deref())
            {
                Ok(current) => current,
                Err(e) => {
                    outcome
                        .errors
                        .push(RecordError::new(&change, e.record_kind(), e.to_string()));
                    continue;
                }
            };
            if let Detection::Conflict {
                conflict_type,
                differing_fields,
            } = self.detector.detect(&change, current.as_ref())
            {
                outcome.conflicts.push(self.detector.build_conflict(
                    &change,
                    current.as_ref(),
                    conflict_type,
                    differing_fields,
                    now,
                ));
                continue;
            }

            if !queue.iter().any(|queued| queued.id == change.id) {
                queue.push(change.clone());
            }
            outcome.saved_changes.push(change.id);
        }

        let queued = queue.len();
        self.queues.store(id, queue)?;
        session.last_activity = now;
        self.store(&session, now)?;

        debug!(
            session_id = id,
            saved = outcome.saved_changes.len(),
            conflicts = outcome.conflicts.len(),
            errors = outcome.errors.len(),
            queued,
            "offline changes saved"
        );
        Ok(outcome)
    }

    /// Changes queued for a session, oldest first.
    pub fn pending_changes(&self, id: &str) -> EngineResult<Vec<SyncChange>> {
        if self.load(id)?.is_none() {
            return Err(SyncError::not_found("session", id));
        }
        self.queues.load(id)
    }

    /// Removes and returns the queue of a session.
    ///
    /// Requires `sync`. The offline window is not checked, so work queued
    /// inside the window can still be handed over after it closes.
    pub fn drain_changes(&self, id: &str) -> EngineResult<Vec<SyncChange>> {
        let _guard = self.lock.lock();
        let session = self
            .load(id)?
            .ok_or_else(|| SyncError::not_found("session", id))?;
        if !session.has_capability(Capability::Sync) || session.status == SessionStatus::Suspended {
            return Err(SyncError::capability_denied(id, Capability::Sync));
        }

        let queue = self.queues.take(id)?;
        info!(session_id = id, changes = queue.len(), "offline queue drained");
        Ok(queue)
    }

    /// Ends a session. Returns false if it did not exist.
    pub fn end_session(&self, id: &str) -> EngineResult<bool> {
        let _guard = self.lock.lock();
        self.remove(id)
    }

    fn remove(&self, id: &str) -> EngineResult<bool> {
        let existing = self.load(id)?;
        if let Some(session) = &existing {
            let key = device_key(&session.device_id);
            let mut ids = self.load_ids(&key)?;
            ids.retain(|s| s != id);
            self.store_ids(&key, &ids)?;
        }
        let mut all = self.load_ids(SESSION_INDEX_KEY)?;
        all.retain(|s| s != id);
        self.store_ids(SESSION_INDEX_KEY, &all)?;

        self.cache.delete(&session_key(id));
        self.queues.take(id)?;
        self.cache.delete(&package_key(id));

        if existing.is_some() {
            info!(session_id = id, "offline session ended");
        }
        Ok(existing.is_some())
    }

    /// Stored sessions of a device whose status is `active`.
    ///
    /// Expiry is not evaluated here; call
    /// [`validate_session`](Self::validate_session) per session for that.
    pub fn get_device_sessions(&self, device_id: &str) -> EngineResult<Vec<OfflineSession>> {
        let _guard = self.lock.lock();
        let key = device_key(device_id);
        let ids = self.load_ids(&key)?;

        let mut live_ids = Vec::with_capacity(ids.len());
        let mut sessions = Vec::new();
        for id in &ids {
            if let Some(session) = self.load(id)? {
                live_ids.push(id.clone());
                if session.is_active() {
                    sessions.push(session);
                }
            }
        }
        if live_ids.len() != ids.len() {
            self.store_ids(&key, &live_ids)?;
        }
        Ok(sessions)
    }

    /// Marks every elapsed active session `expired` and forgets evicted ones.
    ///
    /// Returns the number of sessions that expired.
    pub fn sweep_expired(&self) -> EngineResult<usize> {
        let _guard = self.lock.lock();
        let now = self.clock.now_millis();
        let ids = self.load_ids(SESSION_INDEX_KEY)?;

        let mut expired = 0;
        let mut known = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(mut session) = self.load(&id)? else {
                continue;
            };
            if self.expire_if_elapsed(&mut session, now)? {
                expired += 1;
            }
            known.push(id);
        }
        self.store_ids(SESSION_INDEX_KEY, &known)?;

        if expired > 0 {
            info!(expired, "expired offline sessions swept");
        }
        Ok(expired)
    }
}

impl std::fmt::Debug for OfflineSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineSessionManager")
            .field("config", &self.config)
            .finish()
    }
}

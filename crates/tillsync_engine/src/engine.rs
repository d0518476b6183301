//! The assembled sync engine.

use crate::applier::ChangeApplier;
use crate::audit::{AuditSink, TracingAuditSink};
use crate::batch::{BatchManager, NewBatch};
use crate::cache::{KvCache, MemoryCache};
use crate::change_feed::{ChangeFeedReader, FeedPage};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::conflict::ConflictDetector;
use crate::error::EngineResult;
use crate::history::{BatchStore, MemoryBatchStore};
use crate::ledger::{AppliedLedger, MemoryLedger};
use crate::package::PackageBuilder;
use crate::queue::{MemoryOfflineQueueStore, OfflineQueueStore};
use crate::session::OfflineSessionManager;
use crate::stats::StatsCollector;
use crate::store::{EntityRegistry, EntityRepository, ScopeFilter};
use crate::worker::BatchWorker;
use std::sync::Arc;
use tillsync_protocol::{
    BidirectionalRequest, BidirectionalResponse, CheckInResponse, DownloadRequest,
    DownloadResponse, SyncDirection, SyncResult, UploadRequest, UploadResponse,
};
use tracing::info;

/// Assembles a [`SyncEngine`].
///
/// Anything not supplied gets an in-memory default.
pub struct SyncEngineBuilder {
    config: EngineConfig,
    registry: EntityRegistry,
    clock: Option<Arc<dyn Clock>>,
    cache: Option<Arc<dyn KvCache>>,
    audit: Option<Arc<dyn AuditSink>>,
    batch_store: Option<Arc<dyn BatchStore>>,
    ledger: Option<Arc<dyn AppliedLedger>>,
    queue_store: Option<Arc<dyn OfflineQueueStore>>,
}

impl SyncEngineBuilder {
    /// Creates a builder with default settings and no entity types.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            registry: EntityRegistry::new(),
            clock: None,
            cache: None,
            audit: None,
            batch_store: None,
            ledger: None,
            queue_store: None,
        }
    }

    /// Sets the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the key-value cache.
    pub fn with_cache(mut self, cache: Arc<dyn KvCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets the audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Sets the batch history store.
    pub fn with_batch_store(mut self, store: Arc<dyn BatchStore>) -> Self {
        self.batch_store = Some(store);
        self
    }

    /// Sets the ledger of applied change ids.
    pub fn with_ledger(mut self, ledger: Arc<dyn AppliedLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Sets the store for offline change queues.
    pub fn with_queue_store(mut self, store: Arc<dyn OfflineQueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    /// Registers the repository of an entity type.
    pub fn register(mut self, entity: impl Into<String>, repository: Arc<dyn EntityRepository>) -> Self {
        self.registry.register(entity, repository);
        self
    }

    /// Builds the engine. The entity registry is closed from here on.
    pub fn build(self) -> SyncEngine {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(MemoryCache::new(config.offline.cache_capacity)));
        let audit = self.audit.unwrap_or_else(|| Arc::new(TracingAuditSink));
        let batch_store = self
            .batch_store
            .unwrap_or_else(|| Arc::new(MemoryBatchStore::new()));
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(MemoryLedger::new(config.ledger_capacity)));
        let queue_store = self
            .queue_store
            .unwrap_or_else(|| Arc::new(MemoryOfflineQueueStore::new()));
        let registry = Arc::new(self.registry);

        let applier = Arc::new(
            ChangeApplier::new(registry.clone(), audit, clock.clone()).with_ledger(ledger),
        );
        let detector = ConflictDetector::new(config.conflict.clone());
        let stats = StatsCollector::new(
            batch_store.clone(),
            cache.clone(),
            clock.clone(),
            config.stats_staleness,
        );
        let batches = Arc::new(BatchManager::new(
            batch_store,
            applier.clone(),
            detector.clone(),
            stats,
            clock.clone(),
            config.max_retries,
        ));
        let worker = BatchWorker::new(batches.clone(), &config.worker, config.retry.clone());
        let packages = PackageBuilder::new(registry.clone(), config.offline.clone(), clock.clone());
        let sessions = OfflineSessionManager::new(
            cache,
            applier.clone(),
            detector,
            packages,
            clock.clone(),
            config.offline.clone(),
        )
        .with_queue_store(queue_store);

        info!(
            entity_types = registry.len(),
            policy = ?config.conflict.policy,
            "sync engine ready"
        );
        SyncEngine {
            feed: ChangeFeedReader::with_sequence(registry.clone(), applier.sequence().clone()),
            config,
            clock,
            registry,
            applier,
            batches,
            worker,
            sessions,
        }
    }
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side synchronization engine.
///
/// Owns the change feed, batch life cycle, background worker and offline
/// sessions over one closed entity registry.
pub struct SyncEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    registry: Arc<EntityRegistry>,
    applier: Arc<ChangeApplier>,
    feed: ChangeFeedReader,
    batches: Arc<BatchManager>,
    worker: BatchWorker,
    sessions: OfflineSessionManager,
}

impl SyncEngine {
    /// Starts a builder.
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Engine clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Entity registry.
    pub fn registry(&self) -> &Arc<EntityRegistry> {
        &self.registry
    }

    /// Shared write path.
    pub fn applier(&self) -> &Arc<ChangeApplier> {
        &self.applier
    }

    /// Change feed reader.
    pub fn feed(&self) -> &ChangeFeedReader {
        &self.feed
    }

    /// Batch life cycle manager.
    pub fn batches(&self) -> &Arc<BatchManager> {
        &self.batches
    }

    /// Background worker.
    pub fn worker(&self) -> &BatchWorker {
        &self.worker
    }

    /// Offline session manager.
    pub fn sessions(&self) -> &OfflineSessionManager {
        &self.sessions
    }

    /// Records an upload and hands it to the worker.
    ///
    /// Returns as soon as the batch is `processing`. Needs a tokio runtime.
    pub fn upload(&self, request: UploadRequest) -> EngineResult<UploadResponse> {
        let batch = self.batches.create_batch(NewBatch::from(request))?;
        let batch = self.worker.dispatch(&batch.batch_id)?;
        Ok(UploadResponse {
            batch_id: batch.batch_id,
            status: batch.status,
        })
    }

    /// Records an upload and processes it on the calling thread.
    pub fn upload_blocking(&self, request: UploadRequest) -> EngineResult<SyncResult> {
        let batch = self.batches.create_batch(NewBatch::from(request))?;
        self.batches.process_batch(&batch.batch_id)
    }

    /// Changes written after the request's watermark.
    ///
    /// The returned timestamp never skips unread records of any entity type,
    /// so it can be sent back as the next `last_sync_time`.
    pub fn download(&self, request: &DownloadRequest) -> EngineResult<DownloadResponse> {
        let page = self.feed.read(
            request.entities.as_deref(),
            request.last_sync_time,
            &ScopeFilter::branch(request.branch_id.as_deref()),
            self.config.download_limit,
        )?;
        Ok(DownloadResponse {
            timestamp: page.watermark.unwrap_or(0),
            changes: page.changes,
            has_more: page.has_more,
        })
    }

    /// Download followed by an upload in one exchange.
    ///
    /// The download is read first so the device's own upload is not echoed
    /// back.
    pub fn bidirectional(&self, request: BidirectionalRequest) -> EngineResult<BidirectionalResponse> {
        let download = self.download(&DownloadRequest {
            device_id: request.device_id.clone(),
            branch_id: request.branch_id.clone(),
            last_sync_time: request.last_sync_time,
            entities: request.entities.clone(),
        })?;
        let upload = self.upload(UploadRequest {
            device_id: request.device_id,
            branch_id: request.branch_id,
            sync_type: request.sync_type,
            direction: SyncDirection::Bidirectional,
            changes: request.changes,
            metadata: request.metadata,
        })?;
        Ok(BidirectionalResponse {
            upload_batch_id: upload.batch_id,
            download_changes: download.changes,
            timestamp: download.timestamp,
        })
    }

    /// Changes written inside the recent-changes window.
    pub fn recent_changes(&self, scope: &ScopeFilter) -> EngineResult<FeedPage> {
        let window = u64::try_from(self.config.recent_changes_window.as_millis()).unwrap_or(u64::MAX);
        let since = self.clock.now_millis().saturating_sub(window);
        self.feed
            .read(None, Some(since), scope, self.config.download_limit)
    }

    /// Batch state with conflicts re-checked.
    pub fn batch_status(&self, batch_id: &str) -> EngineResult<SyncResult> {
        let batch = self.batches.refresh_status(batch_id)?;
        Ok(SyncResult::from_batch(&batch))
    }

    /// Hands an offline session's queue over as an upload and ends the
    /// session.
    pub fn check_in(&self, session_id: &str) -> EngineResult<CheckInResponse> {
        let session = self.sessions.get_session(session_id)?;
        let queued = self.sessions.drain_changes(session_id)?;
        let queued_changes = queued.len() as u64;

        let batch_id = if queued.is_empty() {
            None
        } else {
            let mut upload = NewBatch::upload(session.device_id.clone(), queued);
            upload.branch_id = session.branch_id.clone();
            let batch = self.batches.create_batch(upload)?;
            self.worker.dispatch(&batch.batch_id)?;
            Some(batch.batch_id)
        };

        self.sessions.end_session(session_id)?;
        info!(session_id, queued_changes, batch_id = ?batch_id, "offline session checked in");
        Ok(CheckInResponse {
            batch_id,
            queued_changes,
        })
    }

    /// Stops the background worker.
    pub fn shutdown(&self) {
        self.worker.shutdown();
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("registry", &self.registry)
            .field("worker", &self.worker)
            .finish()
    }
}

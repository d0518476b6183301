//! # TillSync Engine
//!
//! Server-side synchronization and offline consistency for TillSync.
//!
//! This crate provides:
//! - Change feed over registered entity repositories
//! - Conflict detection (version, data, deleted) and resolution
//! - Batch life cycle (pending → processing → completed / failed / conflicted)
//! - Background batch worker with cancellation and automatic retry
//! - Offline sessions, data packages and change queues
//! - Cached batch statistics
//!
//! ## Architecture
//!
//! Devices upload changes in batches. Each change is checked against the
//! stored record before it is written:
//! 1. No conflict: write through the shared applier and audit it
//! 2. Conflict: record it on the batch and leave the store untouched
//! 3. Failure: record it on the batch and continue with the next change
//!
//! Every write, whether from a device, a conflict resolution or a server-side
//! business module, goes through [`ChangeApplier`].
//!
//! ## Key Invariants
//!
//! - Applying the same change id twice writes and audits once
//! - Writes to one record are serialized from conflict check to store write
//! - Write stamps are unique across entity types, so download watermarks
//!   never skip a record
//! - A batch is never `completed` while a conflict is unresolved
//! - `processed + failed + conflicted == total` once a batch settles
//! - Retries never exceed `max_retries`
//! - A session never authorizes `write` unless it is active and unexpired

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod audit;
mod batch;
mod cache;
mod change_feed;
mod clock;
mod config;
mod conflict;
mod engine;
mod error;
mod history;
mod ledger;
mod package;
mod queue;
mod sequence;
mod session;
mod stats;
mod store;
mod worker;

pub use applier::{applied_change, ApplyContext, ApplyOutcome, ChangeApplier, TargetGuard};
pub use audit::{AuditCategory, AuditEntry, AuditSink, MemoryAuditLog, TracingAuditSink, AUDIT_MODULE};
pub use batch::{BatchManager, CancelFlag, NewBatch, ResolvedConflict};
pub use cache::{get_decoded, set_encoded, KvCache, MemoryCache};
pub use change_feed::{record_to_change, ChangeFeedReader, FeedPage};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConflictConfig, EngineConfig, OfflineConfig, RetryConfig, WorkerConfig,
    DEFAULT_OFFLINE_ENTITIES, DEFAULT_SIGNIFICANT_FIELDS,
};
pub use conflict::{ConflictDetector, Detection};
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{EngineResult, SyncError};
pub use history::{BatchStore, MemoryBatchStore};
pub use ledger::{AppliedLedger, MemoryLedger, DEFAULT_LEDGER_CAPACITY};
pub use package::{package_checksum, PackageBuilder, PACKAGE_FORMAT_VERSION};
pub use queue::{MemoryOfflineQueueStore, OfflineQueueStore};
pub use sequence::WriteSequence;
pub use session::{NewSession, OfflineSessionManager, SESSION_RETENTION};
pub use stats::{aggregate, StatsCollector};
pub use store::{
    EntityRegistry, EntityRepository, MemoryRepository, ScopeFilter, StoredRecord, WriteRequest,
};
pub use worker::{BatchObserver, BatchWorker};

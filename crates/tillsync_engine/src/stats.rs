//! Batch statistics.
//!
//! Figures are computed from the batch history and cached per filter. A
//! cached value is served while it is younger than the staleness window.

use crate::cache::{get_decoded, set_encoded, KvCache};
use crate::clock::Clock;
use crate::error::EngineResult;
use crate::history::BatchStore;
use std::sync::Arc;
use std::time::Duration;
use tillsync_protocol::{BatchStatus, StatsFilter, SyncBatch, SyncStats};
use tracing::{debug, warn};

/// Computes and caches [`SyncStats`].
pub struct StatsCollector {
    store: Arc<dyn BatchStore>,
    cache: Arc<dyn KvCache>,
    clock: Arc<dyn Clock>,
    staleness: Duration,
}

impl StatsCollector {
    /// Creates a collector.
    pub fn new(
        store: Arc<dyn BatchStore>,
        cache: Arc<dyn KvCache>,
        clock: Arc<dyn Clock>,
        staleness: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            clock,
            staleness,
        }
    }

    /// Statistics for a filter, from cache when fresh.
    pub fn get(&self, filter: &StatsFilter) -> EngineResult<SyncStats> {
        let key = filter.cache_key();
        let now = self.clock.now_millis();
        let staleness_ms = u64::try_from(self.staleness.as_millis()).unwrap_or(u64::MAX);

        match get_decoded::<SyncStats>(self.cache.as_ref(), &key) {
            Ok(Some(cached)) if now.saturating_sub(cached.computed_at) <= staleness_ms => {
                debug!(key = %key, "stats served from cache");
                return Ok(cached);
            }
            Ok(_) => {}
            Err(e) => warn!(key = %key, error = %e, "discarding unreadable cached stats"),
        }

        let stats = self.compute(filter)?;
        // The cache entry outlives the staleness window so the clock, not the
        // cache, decides freshness.
        set_encoded(self.cache.as_ref(), &key, &stats, Some(self.staleness * 4))?;
        Ok(stats)
    }

    /// Computes statistics from the batch history, bypassing the cache.
    pub fn compute(&self, filter: &StatsFilter) -> EngineResult<SyncStats> {
        let batches = self.store.list(filter)?;
        Ok(aggregate(&batches, self.clock.now_millis()))
    }

    /// Drops the cached value of a filter.
    pub fn invalidate(&self, filter: &StatsFilter) {
        self.cache.delete(&filter.cache_key());
    }
}

/// Folds a set of batches into statistics.
pub fn aggregate(batches: &[SyncBatch], computed_at: u64) -> SyncStats {
    let mut stats = SyncStats {
        computed_at,
        ..SyncStats::default()
    };
    let mut latency_total = 0u64;
    let mut latency_count = 0u64;

    for batch in batches {
        stats.total_batches += 1;
        match batch.status {
            BatchStatus::Pending => stats.pending_batches += 1,
            BatchStatus::Processing => stats.processing_batches += 1,
            BatchStatus::Completed => stats.completed_batches += 1,
            BatchStatus::Failed => stats.failed_batches += 1,
            BatchStatus::Conflicted => stats.conflicted_batches += 1,
        }
        stats.total_records += u64::from(batch.total_records);
        stats.processed_records += u64::from(batch.processed_records);
        stats.failed_records += u64::from(batch.failed_records);
        stats.conflicted_records += u64::from(batch.conflicted_records);
        stats.unresolved_conflicts += batch.unresolved_conflicts().count() as u64;

        if let Some(ms) = batch.processing_ms {
            latency_total += ms;
            latency_count += 1;
        }
        if let Some(done) = batch.completed_at {
            stats.last_sync_time = stats.last_sync_time.max(Some(done));
        }
    }

    if latency_count > 0 {
        stats.average_processing_ms = latency_total as f64 / latency_count as f64;
    }
    stats
}

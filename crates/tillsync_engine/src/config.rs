//! Configuration for the sync engine.

use crate::ledger::DEFAULT_LEDGER_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tillsync_protocol::ConflictPolicy;

/// Fields compared by the data-conflict check when an entity type has no
/// override.
pub const DEFAULT_SIGNIFICANT_FIELDS: &[&str] = &["name", "price", "quantity", "status", "is_active"];

/// Entity types exported to offline devices when a package request names none.
pub const DEFAULT_OFFLINE_ENTITIES: &[&str] = &["products", "categories", "customers", "settings"];

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Retry cap stamped on new batches.
    pub max_retries: u32,
    /// Backoff for automatic retries.
    pub retry: RetryConfig,
    /// Conflict detection settings.
    pub conflict: ConflictConfig,
    /// Offline session settings.
    pub offline: OfflineConfig,
    /// Worker pool settings.
    pub worker: WorkerConfig,
    /// How long cached statistics stay fresh.
    pub stats_staleness: Duration,
    /// Maximum records per entity type in one download.
    pub download_limit: usize,
    /// Window of the catch-up feed sent to new connections.
    pub recent_changes_window: Duration,
    /// Change ids remembered by the in-memory ledger. Replays of older ids
    /// are checked against the stored version instead.
    pub ledger_capacity: u64,
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_retries: 3,
            retry: RetryConfig::default(),
            conflict: ConflictConfig::default(),
            offline: OfflineConfig::default(),
            worker: WorkerConfig::default(),
            stats_staleness: Duration::from_secs(30),
            download_limit: 1_000,
            recent_changes_window: Duration::from_secs(5 * 60),
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }

    /// Sets the retry cap for new batches.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the conflict settings.
    pub fn with_conflict(mut self, conflict: ConflictConfig) -> Self {
        self.conflict = conflict;
        self
    }

    /// Sets the offline settings.
    pub fn with_offline(mut self, offline: OfflineConfig) -> Self {
        self.offline = offline;
        self
    }

    /// Sets the worker settings.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Sets the statistics staleness window.
    pub fn with_stats_staleness(mut self, staleness: Duration) -> Self {
        self.stats_staleness = staleness;
        self
    }

    /// Sets the per-entity download limit.
    pub fn with_download_limit(mut self, limit: usize) -> Self {
        self.download_limit = limit;
        self
    }

    /// Sets the catch-up window.
    pub fn with_recent_changes_window(mut self, window: Duration) -> Self {
        self.recent_changes_window = window;
        self
    }

    /// Sets the in-memory ledger capacity.
    pub fn with_ledger_capacity(mut self, capacity: u64) -> Self {
        self.ledger_capacity = capacity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Conflict detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Automatic resolution policy.
    pub policy: ConflictPolicy,
    /// Significant fields for entity types without an override.
    pub default_fields: Vec<String>,
    /// Per entity type significant fields.
    pub entity_fields: HashMap<String, Vec<String>>,
    /// How far (in version units) a change may be ahead of the stored
    /// version and still be field-compared. `0` compares equal versions only.
    pub data_conflict_window: u64,
}

impl ConflictConfig {
    /// Creates the default settings.
    pub fn new() -> Self {
        Self {
            policy: ConflictPolicy::Manual,
            default_fields: DEFAULT_SIGNIFICANT_FIELDS
                .iter()
                .map(|f| f.to_string())
                .collect(),
            entity_fields: HashMap::new(),
            data_conflict_window: 0,
        }
    }

    /// Sets the automatic resolution policy.
    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the significant fields of one entity type.
    pub fn with_entity_fields<I, S>(mut self, entity: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entity_fields
            .insert(entity.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the data-conflict window.
    pub fn with_data_conflict_window(mut self, window: u64) -> Self {
        self.data_conflict_window = window;
        self
    }

    /// Significant fields for an entity type.
    pub fn fields_for(&self, entity: &str) -> &[String] {
        self.entity_fields
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&self.default_fields)
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Offline session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Offline window for sessions that do not ask for one.
    pub default_max_offline_hours: u32,
    /// Upper bound on requested offline windows.
    pub max_offline_hours_limit: u32,
    /// Entity types exported when a package request names none.
    pub default_entities: Vec<String>,
    /// Fields exported per entity type. Types without an entry export only
    /// `id` and `version`.
    pub offline_fields: HashMap<String, Vec<String>>,
    /// Maximum records per entity type in one package.
    pub max_package_rows: usize,
    /// Capacity of the session cache.
    pub cache_capacity: u64,
}

impl OfflineConfig {
    /// Creates the default settings.
    pub fn new() -> Self {
        let fields = |list: &[&str]| list.iter().map(|f| f.to_string()).collect::<Vec<_>>();
        let mut offline_fields = HashMap::new();
        offline_fields.insert(
            "products".to_string(),
            fields(&["name", "sku", "barcode", "price", "category_id", "is_active"]),
        );
        offline_fields.insert(
            "categories".to_string(),
            fields(&["name", "parent_id", "is_active"]),
        );
        offline_fields.insert(
            "customers".to_string(),
            fields(&["name", "phone", "loyalty_points"]),
        );
        offline_fields.insert("settings".to_string(), fields(&["key", "value"]));

        Self {
            default_max_offline_hours: 24,
            max_offline_hours_limit: 72,
            default_entities: DEFAULT_OFFLINE_ENTITIES
                .iter()
                .map(|e| e.to_string())
                .collect(),
            offline_fields,
            max_package_rows: 1_000,
            cache_capacity: 10_000,
        }
    }

    /// Sets the default offline window.
    pub fn with_default_max_offline_hours(mut self, hours: u32) -> Self {
        self.default_max_offline_hours = hours;
        self
    }

    /// Sets the default package entity types.
    pub fn with_default_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_entities = entities.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the offline-safe fields of one entity type.
    pub fn with_offline_fields<I, S>(mut self, entity: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.offline_fields
            .insert(entity.into(), fields.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the package row cap.
    pub fn with_max_package_rows(mut self, rows: usize) -> Self {
        self.max_package_rows = rows;
        self
    }

    /// Offline-safe fields of an entity type.
    pub fn safe_fields(&self, entity: &str) -> &[String] {
        self.offline_fields
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Batches processed at the same time.
    pub max_concurrent_batches: usize,
}

impl WorkerConfig {
    /// Creates the default settings.
    pub fn new() -> Self {
        Self {
            max_concurrent_batches: 4,
        }
    }

    /// Sets the concurrency limit.
    pub fn with_max_concurrent_batches(mut self, n: usize) -> Self {
        self.max_concurrent_batches = n.max(1);
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for automatic retry of failed batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Whether the worker retries failed batches on its own.
    pub auto_retry: bool,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with automatic retries disabled.
    pub fn new() -> Self {
        Self {
            auto_retry: false,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Enables automatic retries.
    pub fn automatic(mut self) -> Self {
        self.auto_retry = true;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand_jitter();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Cheap time-derived jitter in `[0, 1)`.
fn rand_jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_max_retries(5)
            .with_download_limit(50)
            .with_stats_staleness(Duration::from_secs(2));

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.download_limit, 50);
        assert_eq!(config.stats_staleness, Duration::from_secs(2));
        assert_eq!(config.worker.max_concurrent_batches, 4);
    }

    #[test]
    fn significant_fields_fall_back_to_defaults() {
        let config = ConflictConfig::new().with_entity_fields("invoices", ["total", "status"]);
        assert_eq!(config.fields_for("invoices"), ["total", "status"]);
        assert_eq!(config.fields_for("products").len(), DEFAULT_SIGNIFICANT_FIELDS.len());
        assert!(config.fields_for("products").iter().any(|f| f == "price"));
    }

    #[test]
    fn offline_defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.default_max_offline_hours, 24);
        assert_eq!(config.default_entities.len(), 4);
        assert!(config.safe_fields("products").iter().any(|f| f == "price"));
        assert!(config.safe_fields("invoices").is_empty());
    }

    #[test]
    fn worker_needs_at_least_one_slot() {
        assert_eq!(
            WorkerConfig::new()
                .with_max_concurrent_batches(0)
                .max_concurrent_batches,
            1
        );
    }

    #[test]
    fn config_loads_from_partial_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_retries": 7, "conflict": {"policy": "client_wins"}}"#)
                .unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.conflict.policy, ConflictPolicy::ClientWins);
        assert_eq!(config.conflict.default_fields.len(), 5);
        assert_eq!(config.download_limit, 1_000);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(150));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}

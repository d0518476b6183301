//! Test fixtures and engine helpers.
//!
//! Provides an engine wired to a manual clock, in-memory repositories and a
//! memory audit log, so tests can move time and inspect every write.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{
    Clock, EngineConfig, ManualClock, MemoryAuditLog, MemoryRepository, StoredRecord, SyncEngine,
};
use tillsync_protocol::Operation;

/// Start time of every fixture clock (2024-01-01T00:00:00Z).
pub const FIXTURE_EPOCH: u64 = 1_704_067_200_000;

/// Entity types registered by [`TestEngine::pos`].
pub const POS_ENTITIES: &[&str] = &["Product", "Customer", "Category"];

/// An engine with test collaborators attached.
pub struct TestEngine {
    /// The engine.
    pub engine: Arc<SyncEngine>,
    /// Clock shared by every component.
    pub clock: Arc<ManualClock>,
    /// Every audited write.
    pub audit: Arc<MemoryAuditLog>,
    repositories: BTreeMap<String, Arc<MemoryRepository>>,
}

impl TestEngine {
    /// Creates an engine over in-memory repositories for `entities`.
    pub fn new(entities: &[&str]) -> Self {
        Self::with_config(entities, EngineConfig::default())
    }

    /// Creates an engine with the point-of-sale entity types.
    pub fn pos() -> Self {
        Self::new(POS_ENTITIES)
    }

    /// Creates an engine with a custom configuration.
    pub fn with_config(entities: &[&str], config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH));
        let audit = Arc::new(MemoryAuditLog::new());
        let mut builder = SyncEngine::builder()
            .with_config(config)
            .with_clock(clock.clone())
            .with_audit(audit.clone());

        let mut repositories = BTreeMap::new();
        for entity in entities {
            let repository = Arc::new(MemoryRepository::new(*entity));
            builder = builder.register(*entity, repository.clone());
            repositories.insert(entity.to_string(), repository);
        }

        Self {
            engine: Arc::new(builder.build()),
            clock,
            audit,
            repositories,
        }
    }

    /// Repository of an entity type.
    ///
    /// # Panics
    ///
    /// Panics if the type was not registered.
    pub fn repository(&self, entity: &str) -> &Arc<MemoryRepository> {
        self.repositories
            .get(entity)
            .unwrap_or_else(|| panic!("entity type {entity} is not registered"))
    }

    /// Writes a record directly, as a back-office module would.
    pub fn seed(&self, entity: &str, entity_id: &str, data: Value) -> StoredRecord {
        let operation = match self.stored(entity, entity_id) {
            Some(record) if !record.deleted => Operation::Update,
            _ => Operation::Create,
        };
        self.engine
            .applier()
            .apply_direct(entity, operation, Some(entity_id), data, None)
            .expect("Failed to seed record")
    }

    /// Stored record, including tombstones.
    pub fn stored(&self, entity: &str, entity_id: &str) -> Option<StoredRecord> {
        self.engine
            .applier()
            .current(entity, Some(entity_id))
            .expect("Failed to read record")
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Current fixture time.
    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }
}

impl std::ops::Deref for TestEngine {
    type Target = SyncEngine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

/// Runs a test with a point-of-sale engine.
///
/// # Example
///
/// ```rust,ignore
/// use tillsync_testkit::with_pos_engine;
///
/// #[test]
/// fn my_test() {
///     with_pos_engine(|t| {
///         t.seed("Product", "p1", serde_json::json!({"name": "Tea"}));
///     });
/// }
/// ```
pub fn with_pos_engine<F, R>(f: F) -> R
where
    F: FnOnce(&TestEngine) -> R,
{
    let fixture = TestEngine::pos();
    f(&fixture)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seed_creates_then_updates() {
        with_pos_engine(|t| {
            let first = t.seed("Product", "p1", json!({"name": "Tea"}));
            let second = t.seed("Product", "p1", json!({"price": 350}));
            assert_eq!(first.version, 1);
            assert_eq!(second.version, 2);
            assert_eq!(second.data, json!({"name": "Tea", "price": 350}));
            assert_eq!(t.audit.len(), 2);
            assert_eq!(t.repository("Product").len(), 1);
        });
    }

    #[test]
    fn clock_is_shared() {
        let t = TestEngine::new(&["Product"]);
        assert_eq!(t.now(), FIXTURE_EPOCH);
        t.advance(Duration::from_secs(1));
        assert_eq!(t.engine.clock().now_millis(), FIXTURE_EPOCH + 1_000);
    }
}

//! Offline data packages.

use crate::clock::Clock;
use crate::config::OfflineConfig;
use crate::error::EngineResult;
use crate::store::{EntityRegistry, ScopeFilter, StoredRecord};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use tillsync_protocol::{to_cbor, OfflineDataPackage, PackageMetadata, Payload};

/// Package format written into [`PackageMetadata::version`].
pub const PACKAGE_FORMAT_VERSION: u32 = 1;

/// Hex SHA-256 over the CBOR encoding of package data, plus the encoded size.
///
/// Entity types and object keys are both sorted, so equal data always hashes
/// the same.
pub fn package_checksum(data: &BTreeMap<String, Vec<Payload>>) -> EngineResult<(String, u64)> {
    let bytes = to_cbor(data)?;
    let digest = Sha256::digest(&bytes);
    Ok((format!("{digest:x}"), bytes.len() as u64))
}

/// Builds read-only exports of live records.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    registry: Arc<EntityRegistry>,
    config: OfflineConfig,
    clock: Arc<dyn Clock>,
}

impl PackageBuilder {
    /// Creates a builder.
    pub fn new(registry: Arc<EntityRegistry>, config: OfflineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            registry,
            config,
            clock,
        }
    }

    /// Entity types exported when a request names none.
    pub fn default_entities(&self) -> &[String] {
        &self.config.default_entities
    }

    /// Exports up to `max_package_rows` live records per entity type.
    ///
    /// Records are projected onto `id`, `version` and the offline-safe fields
    /// of their type. Unknown entity types fail with `NotFound`.
    pub fn build(
        &self,
        session_id: &str,
        entities: Option<&[String]>,
        branch_id: Option<&str>,
    ) -> EngineResult<OfflineDataPackage> {
        let entities = entities.unwrap_or(&self.config.default_entities);
        let scope = ScopeFilter::branch(branch_id);

        let mut data = BTreeMap::new();
        let mut record_counts = BTreeMap::new();
        for entity in entities {
            let repository = self.registry.get(entity)?;
            let safe_fields = self.config.safe_fields(entity);
            let rows: Vec<Payload> = repository
                .find_changed(None, &scope, usize::MAX)?
                .iter()
                .filter(|r| !r.deleted)
                .take(self.config.max_package_rows)
                .map(|r| project(r, safe_fields))
                .collect();

            record_counts.insert(entity.clone(), rows.len() as u64);
            data.insert(entity.clone(), rows);
        }

        let (checksum, data_size) = package_checksum(&data)?;
        let timestamp = self.clock.now_millis();
        Ok(OfflineDataPackage {
            session_id: session_id.to_string(),
            timestamp,
            data,
            metadata: PackageMetadata {
                version: PACKAGE_FORMAT_VERSION,
                last_sync_time: timestamp,
                data_size,
                checksum,
                record_counts,
            },
        })
    }
}

fn project(record: &StoredRecord, safe_fields: &[String]) -> Payload {
    let mut row = serde_json::Map::new();
    row.insert("id".into(), Payload::String(record.entity_id.clone()));
    for field in safe_fields {
        if let Some(value) = record.data.get(field.as_str()) {
            row.insert(field.clone(), value.clone());
        }
    }
    row.insert("version".into(), Payload::from(record.version));
    Payload::Object(row)
}

//! Conflict detection.

use crate::config::ConflictConfig;
use crate::store::StoredRecord;
use tillsync_protocol::{
    ConflictPolicy, ConflictType, Operation, Payload, SyncChange, SyncConflict, VersionedValue,
};
use tracing::debug;

/// Outcome of checking one change against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Safe to apply.
    Clear,
    /// Must not be applied automatically.
    Conflict {
        /// Conflict class.
        conflict_type: ConflictType,
        /// Significant fields that differ (data conflicts only).
        differing_fields: Vec<String>,
    },
}

impl Detection {
    fn conflict(conflict_type: ConflictType) -> Self {
        Detection::Conflict {
            conflict_type,
            differing_fields: Vec::new(),
        }
    }

    /// Returns true for conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Detection::Conflict { .. })
    }
}

/// Decides whether an incoming change conflicts with the stored record.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    /// Creates a detector.
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Automatic resolution policy.
    pub fn policy(&self) -> ConflictPolicy {
        self.config.policy
    }

    /// Checks `change` against the record currently stored for its entity.
    ///
    /// Rules, in order:
    /// 1. Nothing stored: clear.
    /// 2. Stored tombstone: an update, or a create older than the delete, is
    ///    a `deleted` conflict.
    /// 3. Stored version newer than the change: `version` conflict, or
    ///    `deleted` when the change is a delete.
    /// 4. Updates inside the data-conflict window: `data` conflict if any
    ///    significant field present on both sides differs.
    pub fn detect(&self, change: &SyncChange, current: Option<&StoredRecord>) -> Detection {
        let Some(current) = current else {
            return Detection::Clear;
        };

        if current.deleted {
            return match change.operation {
                Operation::Update => Detection::conflict(ConflictType::Deleted),
                Operation::Create if current.version > change.version => {
                    Detection::conflict(ConflictType::Deleted)
                }
                _ => Detection::Clear,
            };
        }

        if current.version > change.version {
            let conflict_type = if change.operation == Operation::Delete {
                ConflictType::Deleted
            } else {
                ConflictType::Version
            };
            return Detection::conflict(conflict_type);
        }

        if change.operation == Operation::Update
            && change.version - current.version <= self.config.data_conflict_window
        {
            let differing_fields = self.differing_fields(&change.entity, &current.data, &change.data);
            if !differing_fields.is_empty() {
                debug!(
                    change_id = %change.id,
                    fields = ?differing_fields,
                    "significant fields diverged"
                );
                return Detection::Conflict {
                    conflict_type: ConflictType::Data,
                    differing_fields,
                };
            }
        }

        Detection::Clear
    }

    /// Significant fields of `entity` present in both payloads with different
    /// values.
    pub fn differing_fields(&self, entity: &str, current: &Payload, incoming: &Payload) -> Vec<String> {
        self.config
            .fields_for(entity)
            .iter()
            .filter(|field| match (current.get(field.as_str()), incoming.get(field.as_str())) {
                (Some(a), Some(b)) => a != b,
                _ => false,
            })
            .cloned()
            .collect()
    }

    /// Builds the conflict record for a detection.
    pub fn build_conflict(
        &self,
        change: &SyncChange,
        current: Option<&StoredRecord>,
        conflict_type: ConflictType,
        differing_fields: Vec<String>,
        detected_at: u64,
    ) -> SyncConflict {
        let local = match current {
            Some(record) if record.deleted => VersionedValue::tombstone(record.version),
            Some(record) => VersionedValue::live(record.version, record.data.clone()),
            None => VersionedValue {
                version: 0,
                data: None,
                deleted: false,
            },
        };
        SyncConflict::new(
            uuid::Uuid::new_v4().to_string(),
            change,
            local,
            conflict_type,
            differing_fields,
            detected_at,
        )
    }
}

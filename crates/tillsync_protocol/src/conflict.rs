//! Conflict detection results and resolution.
//!
//! In a conflict, "local" is the value currently held by the central store
//! and "remote" is the incoming value from the device.

use crate::change::{Operation, SyncChange};
use crate::Payload;
use serde::{Deserialize, Serialize};

/// Why a change was not applied automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The stored version is newer than the change's basis version.
    Version,
    /// Significant fields diverged within the same version window.
    Data,
    /// One side deleted the entity while the other edited it.
    Deleted,
}

/// How a conflict was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Keep the stored value; the incoming change is discarded.
    Local,
    /// Write the incoming value.
    Remote,
    /// Write caller-merged data.
    Merge,
    /// Write caller-supplied data.
    Manual,
}

impl ConflictResolution {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictResolution::Local => 1,
            ConflictResolution::Remote => 2,
            ConflictResolution::Merge => 3,
            ConflictResolution::Manual => 4,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictResolution::Local),
            2 => Some(ConflictResolution::Remote),
            3 => Some(ConflictResolution::Merge),
            4 => Some(ConflictResolution::Manual),
            _ => None,
        }
    }

    /// Returns true if applying this resolution writes to the store.
    pub fn writes_store(&self) -> bool {
        !matches!(self, ConflictResolution::Local)
    }

    /// Returns true if the resolution takes caller data when provided.
    pub fn accepts_data(&self) -> bool {
        matches!(self, ConflictResolution::Merge | ConflictResolution::Manual)
    }
}

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Server always wins.
    ServerWins,
    /// Client always wins.
    ClientWins,
    /// Last write wins (by version).
    LastWriteWins,
    /// Manual resolution required.
    #[default]
    Manual,
}

impl ConflictPolicy {
    /// Returns true if this policy automatically resolves conflicts.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ConflictPolicy::Manual)
    }

    /// Picks a resolution for the conflict, or `None` for manual handling.
    pub fn resolution_for(&self, conflict: &SyncConflict) -> Option<ConflictResolution> {
        match self {
            ConflictPolicy::ServerWins => Some(ConflictResolution::Local),
            ConflictPolicy::ClientWins => Some(ConflictResolution::Remote),
            ConflictPolicy::LastWriteWins => {
                if conflict.remote_version.version >= conflict.local_version.version {
                    Some(ConflictResolution::Remote)
                } else {
                    Some(ConflictResolution::Local)
                }
            }
            ConflictPolicy::Manual => None,
        }
    }
}

/// One side of a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    /// Version of the value.
    pub version: u64,
    /// Entity payload. `None` when absent or deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Payload>,
    /// True if this side is a deletion.
    #[serde(default)]
    pub deleted: bool,
}

impl VersionedValue {
    /// A live value.
    pub fn live(version: u64, data: Payload) -> Self {
        Self {
            version,
            data: Some(data),
            deleted: false,
        }
    }

    /// A deletion.
    pub fn tombstone(version: u64) -> Self {
        Self {
            version,
            data: None,
            deleted: true,
        }
    }

    /// The incoming side of a change.
    pub fn from_change(change: &SyncChange) -> Self {
        if change.operation == Operation::Delete {
            Self::tombstone(change.version)
        } else {
            Self::live(change.version, change.data.clone())
        }
    }
}

/// A change that could not be applied automatically.
///
/// Created by the conflict detector, mutated only by an explicit resolve and
/// never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    /// Conflict id.
    pub id: String,
    /// Change that raised the conflict.
    pub change_id: String,
    /// Entity type.
    pub entity: String,
    /// Entity id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Operation of the incoming change.
    pub operation: Operation,
    /// Currently stored value.
    pub local_version: VersionedValue,
    /// Incoming value.
    pub remote_version: VersionedValue,
    /// Conflict class.
    pub conflict_type: ConflictType,
    /// Significant fields that differ (data conflicts only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub differing_fields: Vec<String>,
    /// Chosen resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    /// Data written by a merge or manual resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Payload>,
    /// Detection time (unix millis).
    pub detected_at: u64,
    /// Resolution time (unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    /// User that made the incoming change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
}

impl SyncConflict {
    /// Creates an unresolved conflict for `change` against the stored value.
    pub fn new(
        id: impl Into<String>,
        change: &SyncChange,
        local_version: VersionedValue,
        conflict_type: ConflictType,
        differing_fields: Vec<String>,
        detected_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            change_id: change.id.clone(),
            entity: change.entity.clone(),
            entity_id: change.entity_id.clone(),
            operation: change.operation,
            local_version,
            remote_version: VersionedValue::from_change(change),
            conflict_type,
            differing_fields,
            resolution: None,
            resolved_data: None,
            detected_at,
            resolved_at: None,
            origin_user_id: change.origin_user_id.clone(),
        }
    }

    /// Returns true if the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Records a resolution.
    pub fn resolve(
        &mut self,
        resolution: ConflictResolution,
        resolved_data: Option<Payload>,
        resolved_at: u64,
    ) {
        self.resolution = Some(resolution);
        self.resolved_data = resolved_data;
        self.resolved_at = Some(resolved_at);
    }

    /// Version for a resolution write: strictly newer than both captured
    /// sides and than `stored_version`, the version stored when the
    /// resolution is written.
    pub fn resolution_version(&self, stored_version: u64) -> u64 {
        self.local_version
            .version
            .max(self.remote_version.version)
            .max(stored_version)
            .saturating_add(1)
    }
}

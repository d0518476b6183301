//! Offline sessions and data packages.

use crate::batch::RecordError;
use crate::conflict::SyncConflict;
use crate::Payload;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const MILLIS_PER_HOUR: u64 = 3_600_000;

/// State of an offline session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Usable.
    Active,
    /// Past its offline window.
    Expired,
    /// Disabled by an operator.
    Suspended,
}

/// What a session is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Fetch data packages.
    Read,
    /// Queue offline changes.
    Write,
    /// Check queued changes back in.
    Sync,
}

impl Capability {
    /// Capabilities granted when none are requested.
    pub fn defaults() -> BTreeSet<Capability> {
        [Capability::Read, Capability::Write, Capability::Sync]
            .into_iter()
            .collect()
    }

    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Sync => "sync",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fingerprint of the last package handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSnapshot {
    /// Package time (unix millis).
    pub timestamp: u64,
    /// Hex SHA-256 of the package data.
    pub checksum: String,
    /// Entity types in the package.
    pub entities: Vec<String>,
}

/// A device's permission to operate disconnected for a bounded time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineSession {
    /// Session id, derived from device and start time.
    pub id: String,
    /// Device holding the session.
    pub device_id: String,
    /// User operating the device.
    pub user_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Start time (unix millis).
    pub started_at: u64,
    /// Last activity ping (unix millis).
    pub last_activity: u64,
    /// Session state.
    pub status: SessionStatus,
    /// Granted capabilities.
    pub capabilities: BTreeSet<Capability>,
    /// Offline window, measured from `started_at`.
    pub max_offline_hours: u32,
    /// Last package fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_snapshot: Option<DataSnapshot>,
}

impl OfflineSession {
    /// Returns true if the capability was granted.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Returns true if the status is active. Does not check the clock.
    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Time at which the offline window closes.
    pub fn expires_at(&self) -> u64 {
        self.started_at
            .saturating_add(u64::from(self.max_offline_hours) * MILLIS_PER_HOUR)
    }

    /// Returns true if more than `max_offline_hours` elapsed at `now`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        now > self.expires_at()
    }

    /// Returns true if the session may perform `capability` at `now`.
    pub fn permits(&self, capability: Capability, now: u64) -> bool {
        self.is_active() && !self.is_expired_at(now) && self.has_capability(capability)
    }
}

/// Metadata describing a data package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Package format version.
    pub version: u32,
    /// Time the package was built (unix millis).
    pub last_sync_time: u64,
    /// Encoded size of the package data in bytes.
    pub data_size: u64,
    /// Hex SHA-256 of the package data.
    pub checksum: String,
    /// Records exported per entity type.
    #[serde(default)]
    pub record_counts: BTreeMap<String, u64>,
}

/// Point-in-time export a device carries offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineDataPackage {
    /// Owning session.
    pub session_id: String,
    /// Build time (unix millis).
    pub timestamp: u64,
    /// Projected records per entity type.
    pub data: BTreeMap<String, Vec<Payload>>,
    /// Package metadata.
    pub metadata: PackageMetadata,
}

/// Per-item outcome of saving offline changes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SaveChangesOutcome {
    /// Change ids appended to the session queue.
    pub saved_changes: Vec<String>,
    /// Changes that conflict with the store and were not queued.
    pub conflicts: Vec<SyncConflict>,
    /// Changes rejected outright.
    pub errors: Vec<RecordError>,
}

impl SaveChangesOutcome {
    /// Number of items accounted for.
    pub fn total(&self) -> usize {
        self.saved_changes.len() + self.conflicts.len() + self.errors.len()
    }
}

//! Sync batches and their outcomes.

use crate::change::{Operation, SyncChange};
use crate::conflict::SyncConflict;
use crate::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Scope of a sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Full export or import.
    Full,
    /// Everything since the last watermark.
    Incremental,
    /// Only explicitly listed changes.
    ChangesOnly,
}

/// Direction of a sync exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Device to server.
    Upload,
    /// Server to device.
    Download,
    /// Both ways.
    Bidirectional,
}

/// Life cycle state of a batch.
///
/// ```text
/// pending -> processing -> completed
///                       -> failed     -> pending (explicit retry)
///                       -> conflicted -> completed (all conflicts resolved)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Created, not yet picked up.
    Pending,
    /// A worker is applying the changes.
    Processing,
    /// Every change applied or its conflict resolved.
    Completed,
    /// At least one change failed to apply.
    Failed,
    /// Unresolved conflicts remain.
    Conflicted,
}

impl BatchStatus {
    /// Returns the wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
            BatchStatus::Conflicted => "conflicted",
        }
    }

    /// Returns true if the transition `self -> next` is allowed.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        use BatchStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Conflicted)
                | (Conflicted, Completed)
                | (Failed, Pending)
        )
    }

    /// Returns true if no further processing happens without operator action.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Conflicted
        )
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a per-record failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordErrorKind {
    /// Entity type or record does not exist.
    NotFound,
    /// The repository rejected the write.
    ApplyFailure,
    /// The session lacks the needed capability.
    CapabilityDenied,
    /// The change is structurally invalid.
    InvalidChange,
    /// Processing was cancelled before the change was reached.
    Cancelled,
}

/// A failure attached to a single change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordError {
    /// Change that failed.
    pub change_id: String,
    /// Entity type of the change.
    pub entity: String,
    /// Entity id of the change, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Failure class.
    pub kind: RecordErrorKind,
    /// Human readable message.
    pub message: String,
}

impl RecordError {
    /// Creates an error for the given change.
    pub fn new(change: &SyncChange, kind: RecordErrorKind, message: impl Into<String>) -> Self {
        Self {
            change_id: change.id.clone(),
            entity: change.entity.clone(),
            entity_id: change.entity_id.clone(),
            kind,
            message: message.into(),
        }
    }
}

/// A change that reached the store, reported for broadcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    /// Change id.
    pub change_id: String,
    /// Entity type.
    pub entity: String,
    /// Entity id as stored.
    pub entity_id: String,
    /// Mutation kind.
    pub operation: Operation,
    /// Stored payload after the write.
    pub data: Payload,
    /// Stored version after the write.
    pub version: u64,
    /// Originating user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
}

/// A unit of upload work from one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Batch id, unique per device and time.
    pub batch_id: String,
    /// Uploading device.
    pub device_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Sync scope.
    pub sync_type: SyncType,
    /// Sync direction.
    pub direction: SyncDirection,
    /// Changes in submission order.
    pub changes: Vec<SyncChange>,
    /// Life cycle state.
    pub status: BatchStatus,
    /// Number of changes.
    pub total_records: u32,
    /// Changes applied (or skipped as already applied).
    pub processed_records: u32,
    /// Changes that failed.
    pub failed_records: u32,
    /// Changes that raised a conflict.
    pub conflicted_records: u32,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Retry cap.
    pub max_retries: u32,
    /// Conflicts raised by this batch. Never removed.
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    /// Failures from the latest attempt.
    #[serde(default)]
    pub errors: Vec<RecordError>,
    /// Free-form metadata from the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Payload>,
    /// Creation time (unix millis).
    pub created_at: u64,
    /// Start of the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// End of the latest attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Duration of the latest attempt in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_ms: Option<u64>,
}

impl SyncBatch {
    /// Creates a pending batch.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        batch_id: impl Into<String>,
        device_id: impl Into<String>,
        branch_id: Option<String>,
        sync_type: SyncType,
        direction: SyncDirection,
        changes: Vec<SyncChange>,
        max_retries: u32,
        created_at: u64,
    ) -> Self {
        let total_records = u32::try_from(changes.len()).unwrap_or(u32::MAX);
        Self {
            batch_id: batch_id.into(),
            device_id: device_id.into(),
            branch_id,
            sync_type,
            direction,
            changes,
            status: BatchStatus::Pending,
            total_records,
            processed_records: 0,
            failed_records: 0,
            conflicted_records: 0,
            retry_count: 0,
            max_retries,
            conflicts: Vec::new(),
            errors: Vec::new(),
            metadata: None,
            created_at,
            started_at: None,
            completed_at: None,
            processing_ms: None,
        }
    }

    /// Returns true if `processed + failed + conflicted == total`.
    pub fn is_balanced(&self) -> bool {
        self.processed_records + self.failed_records + self.conflicted_records
            == self.total_records
    }

    /// Iterates over conflicts without a resolution.
    pub fn unresolved_conflicts(&self) -> impl Iterator<Item = &SyncConflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved())
    }

    /// Returns true if any conflict is unresolved.
    pub fn has_unresolved_conflicts(&self) -> bool {
        self.unresolved_conflicts().next().is_some()
    }

    /// Looks up a conflict by id.
    pub fn conflict(&self, conflict_id: &str) -> Option<&SyncConflict> {
        self.conflicts.iter().find(|c| c.id == conflict_id)
    }

    /// Looks up a conflict by id for mutation.
    pub fn conflict_mut(&mut self, conflict_id: &str) -> Option<&mut SyncConflict> {
        self.conflicts.iter_mut().find(|c| c.id == conflict_id)
    }

    /// Looks up the conflict raised by a change.
    pub fn conflict_for_change(&self, change_id: &str) -> Option<&SyncConflict> {
        self.conflicts.iter().find(|c| c.change_id == change_id)
    }

    /// Returns true if an explicit retry is allowed.
    pub fn can_retry(&self) -> bool {
        self.status == BatchStatus::Failed && self.retry_count < self.max_retries
    }

    /// Status the batch settles in after processing.
    ///
    /// Failure wins over conflicts, and conflicts keep the batch out of
    /// `completed` until every one is resolved.
    pub fn settled_status(&self) -> BatchStatus {
        if self.failed_records > 0 {
            BatchStatus::Failed
        } else if self.has_unresolved_conflicts() {
            BatchStatus::Conflicted
        } else {
            BatchStatus::Completed
        }
    }
}

/// Outcome of processing a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Batch id.
    pub batch_id: String,
    /// Uploading device.
    pub device_id: String,
    /// Status after processing.
    pub status: BatchStatus,
    /// Number of changes.
    pub total_records: u32,
    /// Changes applied.
    pub processed_records: u32,
    /// Changes that failed.
    pub failed_records: u32,
    /// Changes that raised a conflict.
    pub conflicted_records: u32,
    /// All conflicts of the batch.
    pub conflicts: Vec<SyncConflict>,
    /// Failures of the latest attempt.
    pub errors: Vec<RecordError>,
    /// Changes written to the store by the latest attempt.
    #[serde(default)]
    pub applied: Vec<AppliedChange>,
    /// Duration of the latest attempt in milliseconds.
    pub processing_ms: u64,
}

impl SyncResult {
    /// Summarises a batch. `applied` is left empty.
    pub fn from_batch(batch: &SyncBatch) -> Self {
        Self {
            batch_id: batch.batch_id.clone(),
            device_id: batch.device_id.clone(),
            status: batch.status,
            total_records: batch.total_records,
            processed_records: batch.processed_records,
            failed_records: batch.failed_records,
            conflicted_records: batch.conflicted_records,
            conflicts: batch.conflicts.clone(),
            errors: batch.errors.clone(),
            applied: Vec::new(),
            processing_ms: batch.processing_ms.unwrap_or(0),
        }
    }

    /// Attaches the changes written by the attempt.
    pub fn with_applied(mut self, applied: Vec<AppliedChange>) -> Self {
        self.applied = applied;
        self
    }
}

//! Request/response messages for sync.

use crate::batch::{BatchStatus, SyncDirection, SyncResult, SyncType};
use crate::change::SyncChange;
use crate::codec::CborCodec;
use crate::conflict::{ConflictResolution, SyncConflict};
use crate::session::{Capability, OfflineDataPackage, OfflineSession, SaveChangesOutcome};
use crate::Payload;
use serde::{Deserialize, Serialize};

/// Device uploads a batch of changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    /// Uploading device.
    pub device_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Sync scope.
    pub sync_type: SyncType,
    /// Direction, `upload` unless part of a bidirectional exchange.
    #[serde(default = "default_direction")]
    pub direction: SyncDirection,
    /// Changes in submission order.
    pub changes: Vec<SyncChange>,
    /// Free-form device metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Payload>,
}

fn default_direction() -> SyncDirection {
    SyncDirection::Upload
}

impl UploadRequest {
    /// Creates an upload of `changes_only` changes.
    pub fn new(device_id: impl Into<String>, changes: Vec<SyncChange>) -> Self {
        Self {
            device_id: device_id.into(),
            branch_id: None,
            sync_type: SyncType::ChangesOnly,
            direction: SyncDirection::Upload,
            changes,
            metadata: None,
        }
    }

    /// Sets the branch scope.
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }
}

/// Acknowledges an upload. Processing continues in the background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// Batch created for the upload.
    pub batch_id: String,
    /// Status at acknowledgement time.
    pub status: BatchStatus,
}

/// Device asks for changes since its watermark.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Requesting device.
    pub device_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Watermark from the previous download. `None` means full export.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
    /// Entity types to include. `None` means all registered types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
}

/// Changes for a download.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadResponse {
    /// Changes ordered by store time.
    pub changes: Vec<SyncChange>,
    /// Watermark for the next download.
    pub timestamp: u64,
    /// True if some entity type was truncated at the download limit.
    #[serde(default)]
    pub has_more: bool,
}

/// Upload and download in one exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidirectionalRequest {
    /// Device.
    pub device_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Sync scope of the upload.
    pub sync_type: SyncType,
    /// Changes to upload.
    pub changes: Vec<SyncChange>,
    /// Download watermark.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
    /// Entity types to download.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
    /// Free-form device metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Payload>,
}

/// Result of a bidirectional exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BidirectionalResponse {
    /// Batch created for the upload half.
    pub upload_batch_id: String,
    /// Changes for the download half.
    pub download_changes: Vec<SyncChange>,
    /// Download watermark.
    pub timestamp: u64,
}

/// Settles one conflict of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveConflictRequest {
    /// Batch holding the conflict.
    pub batch_id: String,
    /// Conflict to resolve.
    pub conflict_id: String,
    /// Chosen resolution.
    pub resolution: ConflictResolution,
    /// Data for merge or manual resolutions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Payload>,
}

/// Names a batch (retry, status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRequest {
    /// Batch id.
    pub batch_id: String,
}

/// Narrows statistics to a device, branch or time range.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StatsFilter {
    /// Only batches from this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    /// Only batches for this branch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Only batches created at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl StatsFilter {
    /// Filter for one device.
    pub fn for_device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: Some(device_id.into()),
            ..Self::default()
        }
    }

    /// Stable key for caching.
    pub fn cache_key(&self) -> String {
        format!(
            "sync_stats:{}:{}:{}",
            self.device_id.as_deref().unwrap_or("*"),
            self.branch_id.as_deref().unwrap_or("*"),
            self.since.map(|s| s.to_string()).unwrap_or_else(|| "*".into())
        )
    }
}

/// Aggregate batch statistics.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// Batches in scope.
    pub total_batches: u64,
    /// Batches waiting for a worker.
    pub pending_batches: u64,
    /// Batches being processed.
    pub processing_batches: u64,
    /// Completed batches.
    pub completed_batches: u64,
    /// Failed batches.
    pub failed_batches: u64,
    /// Batches with unresolved conflicts.
    pub conflicted_batches: u64,
    /// Changes across all batches.
    pub total_records: u64,
    /// Changes applied.
    pub processed_records: u64,
    /// Changes failed.
    pub failed_records: u64,
    /// Changes conflicted.
    pub conflicted_records: u64,
    /// Conflicts still waiting for a resolution.
    pub unresolved_conflicts: u64,
    /// Mean processing latency of processed batches.
    pub average_processing_ms: f64,
    /// Most recent completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<u64>,
    /// Time the figures were computed.
    pub computed_at: u64,
}

/// Opens an offline session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Device.
    pub device_id: String,
    /// User.
    pub user_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Requested capabilities. `None` grants the defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
    /// Offline window. `None` uses the configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_offline_hours: Option<u32>,
}

/// Names an offline session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Session id.
    pub session_id: String,
}

/// Lists a device's sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSessionsRequest {
    /// Device id.
    pub device_id: String,
}

/// Fetches a data package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    /// Session id.
    pub session_id: String,
    /// Entity types. `None` uses the configured allow-list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<String>>,
}

/// Queues changes made offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveChangesRequest {
    /// Session id.
    pub session_id: String,
    /// Changes to queue.
    pub changes: Vec<SyncChange>,
}

/// Result of checking an offline session back in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInResponse {
    /// Batch created from the queue, if it held anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    /// Number of queued changes handed over.
    pub queued_changes: u64,
}

/// Wire error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unknown batch, conflict, session or entity type.
    NotFound,
    /// Operation not allowed in the current state.
    InvalidState,
    /// Retry cap reached.
    RetryExhausted,
    /// Session lacks a capability.
    CapabilityDenied,
    /// A write was rejected.
    ApplyFailure,
    /// Malformed request.
    InvalidRequest,
    /// Missing or bad credentials.
    Unauthorized,
    /// Anything else.
    Internal,
}

/// Error returned in place of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error class.
    pub code: ErrorCode,
    /// Human readable message.
    pub message: String,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Requests accepted by the sync server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncRequest {
    /// Upload a batch.
    Upload(UploadRequest),
    /// Download changes.
    Download(DownloadRequest),
    /// Upload and download.
    Bidirectional(BidirectionalRequest),
    /// Resolve a conflict.
    ResolveConflict(ResolveConflictRequest),
    /// Retry a failed batch.
    Retry(BatchRequest),
    /// Current state of a batch.
    BatchStatus(BatchRequest),
    /// Aggregate statistics.
    Stats(StatsFilter),
    /// Open an offline session.
    CreateSession(CreateSessionRequest),
    /// Check a session.
    ValidateSession(SessionRequest),
    /// Activity ping.
    UpdateActivity(SessionRequest),
    /// Fetch a data package.
    FetchPackage(PackageRequest),
    /// Queue offline changes.
    SaveOfflineChanges(SaveChangesRequest),
    /// Close a session.
    EndSession(SessionRequest),
    /// Turn the session queue into an upload batch and close the session.
    CheckIn(SessionRequest),
    /// List active sessions of a device.
    DeviceSessions(DeviceSessionsRequest),
}

impl SyncRequest {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncRequest::Upload(_) => 1,
            SyncRequest::Download(_) => 2,
            SyncRequest::Bidirectional(_) => 3,
            SyncRequest::ResolveConflict(_) => 4,
            SyncRequest::Retry(_) => 5,
            SyncRequest::BatchStatus(_) => 6,
            SyncRequest::Stats(_) => 7,
            SyncRequest::CreateSession(_) => 8,
            SyncRequest::ValidateSession(_) => 9,
            SyncRequest::UpdateActivity(_) => 10,
            SyncRequest::FetchPackage(_) => 11,
            SyncRequest::SaveOfflineChanges(_) => 12,
            SyncRequest::EndSession(_) => 13,
            SyncRequest::CheckIn(_) => 14,
            SyncRequest::DeviceSessions(_) => 15,
        }
    }

    /// Device named directly by the request, if any.
    pub fn device_id(&self) -> Option<&str> {
        match self {
            SyncRequest::Upload(r) => Some(&r.device_id),
            SyncRequest::Download(r) => Some(&r.device_id),
            SyncRequest::Bidirectional(r) => Some(&r.device_id),
            SyncRequest::CreateSession(r) => Some(&r.device_id),
            SyncRequest::DeviceSessions(r) => Some(&r.device_id),
            SyncRequest::Stats(f) => f.device_id.as_deref(),
            _ => None,
        }
    }
}

impl CborCodec for SyncRequest {}

/// Responses produced by the sync server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SyncResponse {
    /// Upload accepted.
    Upload(UploadResponse),
    /// Download data.
    Download(DownloadResponse),
    /// Bidirectional result.
    Bidirectional(BidirectionalResponse),
    /// Resolved conflict.
    Conflict(SyncConflict),
    /// Batch outcome.
    Batch(SyncResult),
    /// Statistics.
    Stats(SyncStats),
    /// Offline session.
    Session(OfflineSession),
    /// Validation result.
    SessionValid {
        /// Session id.
        session_id: String,
        /// True if the session is usable.
        valid: bool,
    },
    /// Data package.
    Package(OfflineDataPackage),
    /// Save outcome.
    SavedChanges(SaveChangesOutcome),
    /// Check-in outcome.
    CheckIn(CheckInResponse),
    /// Session list.
    Sessions(Vec<OfflineSession>),
    /// Request succeeded without a body.
    Ack,
    /// Request failed.
    Error(ErrorResponse),
}

impl SyncResponse {
    /// Returns true for error responses.
    pub fn is_error(&self) -> bool {
        matches!(self, SyncResponse::Error(_))
    }
}

impl CborCodec for SyncResponse {}

//! # TillSync Protocol
//!
//! Sync data model, wire messages and CBOR codec for TillSync.
//!
//! This crate provides:
//! - `SyncChange` for replicated entity changes
//! - `SyncBatch` and its status life cycle
//! - `SyncConflict` for conflict detection and resolution
//! - `OfflineSession` and `OfflineDataPackage` for disconnected operation
//! - Request/response messages (`SyncRequest`, `SyncResponse`)
//! - Real-time channel messages (`ClientMessage`, `ServerMessage`)
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.
//!
//! # Payloads
//!
//! Entity payloads are opaque JSON values ([`Payload`]). Object keys are kept
//! in sorted order, so encoding the same payload always yields the same
//! bytes. Package checksums depend on that.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod change;
mod codec;
mod conflict;
mod error;
mod messages;
mod realtime;
mod session;

pub use batch::{
    AppliedChange, BatchStatus, RecordError, RecordErrorKind, SyncBatch, SyncDirection,
    SyncResult, SyncType,
};
pub use change::{Operation, SyncChange};
pub use codec::{from_cbor, to_cbor, CborCodec};
pub use conflict::{ConflictPolicy, ConflictResolution, ConflictType, SyncConflict, VersionedValue};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    BatchRequest, BidirectionalRequest, BidirectionalResponse, CheckInResponse,
    CreateSessionRequest, DeviceSessionsRequest, DownloadRequest, DownloadResponse, ErrorCode,
    ErrorResponse, PackageRequest, ResolveConflictRequest, SaveChangesRequest, SessionRequest,
    StatsFilter, SyncRequest, SyncResponse, SyncStats, UploadRequest, UploadResponse,
};
pub use realtime::{ClientMessage, EntityUpdate, ServerMessage, Topic};
pub use session::{
    Capability, DataSnapshot, OfflineDataPackage, OfflineSession, PackageMetadata,
    SaveChangesOutcome, SessionStatus,
};

/// Opaque entity payload carried by changes, conflicts and packages.
pub type Payload = serde_json::Value;

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

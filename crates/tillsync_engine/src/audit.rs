//! Audit trail of applied changes.

use crate::error::EngineResult;
use parking_lot::RwLock;
use serde::Serialize;
use tillsync_protocol::{Operation, Payload};
use tracing::info;

/// Module name stamped on every entry written by the engine.
pub const AUDIT_MODULE: &str = "sync";

/// Why a write happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    /// A change from a device batch.
    SyncApply,
    /// A conflict resolution.
    ConflictResolution,
    /// A write by a business module on the server.
    DirectWrite,
}

impl AuditCategory {
    /// Returns the category name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::SyncApply => "sync_apply",
            AuditCategory::ConflictResolution => "conflict_resolution",
            AuditCategory::DirectWrite => "direct_write",
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    /// Mutation kind.
    pub action: Operation,
    /// Entity type.
    pub entity: String,
    /// Entity id.
    pub entity_id: String,
    /// Payload before the write.
    pub old_values: Option<Payload>,
    /// Payload after the write.
    pub new_values: Option<Payload>,
    /// Writing module.
    pub module: &'static str,
    /// Why the write happened.
    pub category: AuditCategory,
    /// Device that sent the change.
    pub device_id: Option<String>,
    /// Change that caused the write.
    pub change_id: String,
    /// Version written.
    pub version: u64,
    /// Write time (unix millis).
    pub timestamp: u64,
}

/// Receives one entry per applied change.
pub trait AuditSink: Send + Sync {
    /// Records an entry.
    fn log(&self, entry: AuditEntry) -> EngineResult<()>;
}

/// Sink that emits entries as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn log(&self, entry: AuditEntry) -> EngineResult<()> {
        info!(
            target: "tillsync::audit",
            action = %entry.action,
            entity = %entry.entity,
            entity_id = %entry.entity_id,
            module = entry.module,
            category = entry.category.as_str(),
            device_id = entry.device_id.as_deref().unwrap_or("-"),
            change_id = %entry.change_id,
            version = entry.version,
            "audit"
        );
        Ok(())
    }
}

/// Sink that keeps entries in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in write order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().clone()
    }

    /// Entries for one entity.
    pub fn entries_for(&self, entity: &str, entity_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.entity == entity && e.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing was logged.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn log(&self, entry: AuditEntry) -> EngineResult<()> {
        self.entries.write().push(entry);
        Ok(())
    }
}

//! Change feed over the entity repositories.
//!
//! The feed turns records written after a watermark into [`SyncChange`]s.
//! It backs downloads, the gateway catch-up window and `request_update`.
//!
//! A reader bound to the engine's [`WriteSequence`] reads up to the highest
//! committed stamp and never hands out a watermark above it, so a write that
//! commits while a read is under way is picked up by the next read.

use crate::error::EngineResult;
use crate::sequence::WriteSequence;
use crate::store::{EntityRegistry, ScopeFilter, StoredRecord};
use std::sync::Arc;
use tillsync_protocol::{Operation, SyncChange};

/// One page of the feed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FeedPage {
    /// Changes ordered by store time.
    pub changes: Vec<SyncChange>,
    /// Watermark to pass as `since` on the next read. Never skips a record.
    pub watermark: Option<u64>,
    /// True if at least one entity type was cut at the limit.
    pub has_more: bool,
}

/// Reads changed records across entity types.
#[derive(Debug, Clone)]
pub struct ChangeFeedReader {
    registry: Arc<EntityRegistry>,
    sequence: Option<Arc<WriteSequence>>,
}

impl ChangeFeedReader {
    /// Creates a reader over a registry.
    ///
    /// Without a sequence the watermark is the newest stamp read.
    pub fn new(registry: Arc<EntityRegistry>) -> Self {
        Self {
            registry,
            sequence: None,
        }
    }

    /// Creates a reader capped at the committed stamp of `sequence`.
    pub fn with_sequence(registry: Arc<EntityRegistry>, sequence: Arc<WriteSequence>) -> Self {
        Self {
            registry,
            sequence: Some(sequence),
        }
    }

    /// Records of one entity type written after `since`.
    pub fn read_entity(
        &self,
        entity: &str,
        since: Option<u64>,
        scope: &ScopeFilter,
        limit: usize,
    ) -> EngineResult<Vec<SyncChange>> {
        let records = self
            .registry
            .get(entity)?
            .find_changed(since, scope, limit)?;
        Ok(records
            .iter()
            .map(|r| record_to_change(entity, r, since))
            .collect())
    }

    /// Changes of several entity types written after `since`.
    ///
    /// `entities` of `None` reads every registered type. Unknown types fail
    /// with `NotFound`.
    pub fn read(
        &self,
        entities: Option<&[String]>,
        since: Option<u64>,
        scope: &ScopeFilter,
        limit_per_entity: usize,
    ) -> EngineResult<FeedPage> {
        let entity_types = match entities {
            Some(list) => list.to_vec(),
            None => self.registry.entity_types(),
        };
        // Taken before any repository is read.
        let ceiling = self.sequence.as_ref().map(|s| s.committed());

        let mut changes = Vec::new();
        let mut newest: Option<u64> = None;
        let mut truncated_at: Option<u64> = None;

        for entity in &entity_types {
            let mut records = self
                .registry
                .get(entity)?
                .find_changed(since, scope, limit_per_entity)?;
            let fetched = records.len();
            if let Some(high) = ceiling {
                records.retain(|r| r.updated_at <= high);
            }

            if let Some(last) = records.last() {
                newest = newest.max(Some(last.updated_at));
                if fetched >= limit_per_entity && records.len() == fetched {
                    // Unread rows of this type follow `last`; the watermark
                    // must not pass it.
                    truncated_at = Some(truncated_at.map_or(last.updated_at, |t| t.min(last.updated_at)));
                }
            }
            changes.extend(records.iter().map(|r| record_to_change(entity, r, since)));
        }

        changes.sort_by_key(|c| c.timestamp);
        let caught_up = match ceiling {
            Some(0) => since,
            Some(high) => Some(since.map_or(high, |s| s.max(high))),
            None => newest.or(since),
        };
        let watermark = truncated_at.or(caught_up);

        Ok(FeedPage {
            changes,
            watermark,
            has_more: truncated_at.is_some(),
        })
    }
}

/// Converts a stored record into a change relative to `since`.
pub fn record_to_change(entity: &str, record: &StoredRecord, since: Option<u64>) -> SyncChange {
    let operation = if record.deleted {
        Operation::Delete
    } else if since.map_or(true, |s| record.created_at > s) {
        Operation::Create
    } else {
        Operation::Update
    };

    SyncChange {
        id: format!("feed:{entity}:{}:{}", record.entity_id, record.updated_at),
        entity: entity.to_string(),
        entity_id: Some(record.entity_id.clone()),
        operation,
        data: if record.deleted {
            tillsync_protocol::Payload::Null
        } else {
            record.data.clone()
        },
        timestamp: record.updated_at,
        version: record.version,
        origin_user_id: None,
    }
}

//! Real-time channel messages.
//!
//! Frames are JSON text or CBOR binary; both carry the same tagged shape,
//! e.g. `{"type":"subscribe","entity":"products","entity_id":"p1"}`.

use crate::batch::BatchStatus;
use crate::change::SyncChange;
use crate::codec::CborCodec;
use crate::error::{ProtocolError, ProtocolResult};
use crate::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A broadcast topic: an entity type, or one entity of that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Topic for every entity of a type.
    pub fn entity(entity: &str) -> Self {
        Topic(entity.to_string())
    }

    /// Topic for one entity.
    pub fn record(entity: &str, entity_id: &str) -> Self {
        Topic(format!("{entity}:{entity_id}"))
    }

    /// Topic for a subscription request.
    pub fn for_subscription(entity: &str, entity_id: Option<&str>) -> Self {
        match entity_id {
            Some(id) => Topic::record(entity, id),
            None => Topic::entity(entity),
        }
    }

    /// Topics an update of `entity:entity_id` fans out to.
    pub fn fan_out(entity: &str, entity_id: Option<&str>) -> Vec<Topic> {
        let mut topics = vec![Topic::entity(entity)];
        if let Some(id) = entity_id {
            topics.push(Topic::record(entity, id));
        }
        topics
    }

    /// Returns the topic string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for single-entity topics.
    pub fn is_record(&self) -> bool {
        self.0.contains(':')
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Messages sent by devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a topic.
    Subscribe {
        /// Entity type.
        entity: String,
        /// Entity id for a single-record topic.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    /// Leave a topic.
    Unsubscribe {
        /// Entity type.
        entity: String,
        /// Entity id for a single-record topic.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
    },
    /// Ask for the changes of an entity type or record.
    RequestUpdate {
        /// Entity type.
        entity: String,
        /// Entity id to narrow to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
        /// Only changes after this time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_sync_time: Option<u64>,
    },
    /// Keep-alive.
    Ping {
        /// Client clock.
        timestamp: u64,
    },
}

impl ClientMessage {
    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> ProtocolResult<Self> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decoding(e.to_string()))
    }
}

impl CborCodec for ClientMessage {}

/// Payload of an `entity_update` notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Entity type.
    pub entity: String,
    /// Entity id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Entity payload after the change.
    pub data: Payload,
    /// Broadcast time (unix millis).
    pub timestamp: u64,
    /// User whose change triggered the update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_user_id: Option<String>,
}

/// Messages pushed to devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An entity changed.
    EntityUpdate(EntityUpdate),
    /// Catch-up sent right after connecting.
    RecentChanges {
        /// Changes inside the catch-up window.
        changes: Vec<SyncChange>,
        /// Start of the window.
        since: u64,
        /// Send time.
        timestamp: u64,
    },
    /// Reply to `request_update`.
    UpdateData {
        /// Entity type.
        entity: String,
        /// Entity id, if narrowed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
        /// Matching changes.
        changes: Vec<SyncChange>,
        /// Send time.
        timestamp: u64,
    },
    /// A batch uploaded by this device settled.
    BatchCompleted {
        /// Batch id.
        batch_id: String,
        /// Settled status.
        status: BatchStatus,
    },
    /// Subscription confirmed.
    Subscribed {
        /// Topic joined.
        topic: Topic,
    },
    /// Unsubscription confirmed.
    Unsubscribed {
        /// Topic left.
        topic: Topic,
    },
    /// Reply to `ping`.
    Pong {
        /// Server clock.
        timestamp: u64,
    },
    /// A client message was rejected.
    Error {
        /// Reason.
        message: String,
    },
}

impl ServerMessage {
    /// Renders a JSON text frame.
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encoding(e.to_string()))
    }
}

impl CborCodec for ServerMessage {}

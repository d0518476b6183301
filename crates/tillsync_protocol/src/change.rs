//! Replicated entity changes.

use crate::error::{ProtocolError, ProtocolResult};
use crate::Payload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of mutation carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Entity was created.
    Create,
    /// Entity was updated.
    Update,
    /// Entity was deleted.
    Delete,
}

impl Operation {
    /// Returns the wire name of the operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Returns true if the operation carries an entity payload.
    pub fn carries_data(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Operation::Create),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(ProtocolError::unknown_variant("operation", other)),
        }
    }
}

/// A single entity mutation that can be replicated.
///
/// Changes are immutable once created. The `version` is the ordering key used
/// by conflict detection: a change is applied only when the stored version of
/// the same entity is not newer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChange {
    /// Globally unique change id.
    pub id: String,
    /// Logical entity type (for example `products`).
    pub entity: String,
    /// Target entity id. `None` for creates before an id is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Mutation kind.
    pub operation: Operation,
    /// Entity snapshot or delta. `Null` for deletes.
    #[serde(default)]
    pub data: Payload,
    /// Origin clock timestamp (unix millis).
    pub timestamp: u64,
    /// Ordering version.
    pub version: u64,
    /// User that made the change on the device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_user_id: Option<String>,
}

impl SyncChange {
    /// Creates a change with a fresh id. The timestamp defaults to `version`.
    pub fn new(
        entity: impl Into<String>,
        entity_id: Option<String>,
        operation: Operation,
        data: Payload,
        version: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity: entity.into(),
            entity_id,
            operation,
            data,
            timestamp: version,
            version,
            origin_user_id: None,
        }
    }

    /// Creates a `create` change.
    pub fn create(
        entity: impl Into<String>,
        entity_id: Option<String>,
        data: Payload,
        version: u64,
    ) -> Self {
        Self::new(entity, entity_id, Operation::Create, data, version)
    }

    /// Creates an `update` change.
    pub fn update(
        entity: impl Into<String>,
        entity_id: impl Into<String>,
        data: Payload,
        version: u64,
    ) -> Self {
        Self::new(entity, Some(entity_id.into()), Operation::Update, data, version)
    }

    /// Creates a `delete` change.
    pub fn delete(entity: impl Into<String>, entity_id: impl Into<String>, version: u64) -> Self {
        Self::new(
            entity,
            Some(entity_id.into()),
            Operation::Delete,
            Payload::Null,
            version,
        )
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the origin timestamp.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Sets the originating user.
    pub fn with_origin_user(mut self, user_id: impl Into<String>) -> Self {
        self.origin_user_id = Some(user_id.into());
        self
    }

    /// Returns the `entity:entityId` key, if the entity id is known.
    pub fn target_key(&self) -> Option<String> {
        self.entity_id
            .as_ref()
            .map(|id| format!("{}:{}", self.entity, id))
    }

    /// Checks the structural requirements of a change.
    ///
    /// Payload shape is left to the repository that applies the change.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.trim().is_empty() {
            return Err(ProtocolError::invalid_change("", "change id is empty"));
        }
        if self.entity.trim().is_empty() {
            return Err(ProtocolError::invalid_change(&self.id, "entity type is empty"));
        }
        let has_id = self
            .entity_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if !has_id && self.operation != Operation::Create {
            return Err(ProtocolError::invalid_change(
                &self.id,
                format!("{} requires an entity id", self.operation),
            ));
        }
        Ok(())
    }
}

//! Error types for the sync engine.

use thiserror::Error;
use tillsync_protocol::{Capability, ErrorCode, ProtocolError, RecordErrorKind};

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Conflicts are not errors; they are reported on the batch.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A batch, conflict, session or entity type does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up.
        kind: &'static str,
        /// The id that was not found.
        id: String,
    },

    /// The operation is not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The batch already used all of its retries.
    #[error("batch {batch_id} exhausted its {max_retries} retries")]
    RetryExhausted {
        /// Batch id.
        batch_id: String,
        /// Retry cap.
        max_retries: u32,
    },

    /// The session may not perform the operation.
    #[error("session {session_id} lacks the {capability} capability")]
    CapabilityDenied {
        /// Session id.
        session_id: String,
        /// Missing capability.
        capability: Capability,
    },

    /// A repository rejected a write.
    #[error("apply failed for {entity}: {message}")]
    ApplyFailure {
        /// Entity type.
        entity: String,
        /// Repository message.
        message: String,
    },

    /// The request is structurally invalid.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Processing was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Protocol or codec error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Backing store failure (cache, batch history).
    #[error("store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Creates an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Creates an apply failure.
    pub fn apply_failure(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ApplyFailure {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Creates a capability error.
    pub fn capability_denied(session_id: impl Into<String>, capability: Capability) -> Self {
        Self::CapabilityDenied {
            session_id: session_id.into(),
            capability,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::ApplyFailure { .. } | SyncError::Store(_) | SyncError::Cancelled
        )
    }

    /// Wire error class.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NotFound { .. } => ErrorCode::NotFound,
            SyncError::InvalidState(_) => ErrorCode::InvalidState,
            SyncError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            SyncError::CapabilityDenied { .. } => ErrorCode::CapabilityDenied,
            SyncError::ApplyFailure { .. } => ErrorCode::ApplyFailure,
            SyncError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            SyncError::Protocol(e) if !e.is_codec_error() => ErrorCode::InvalidRequest,
            SyncError::Cancelled | SyncError::Protocol(_) | SyncError::Store(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Per-record failure class when the error is attached to one change.
    pub fn record_kind(&self) -> RecordErrorKind {
        match self {
            SyncError::NotFound { .. } => RecordErrorKind::NotFound,
            SyncError::CapabilityDenied { .. } => RecordErrorKind::CapabilityDenied,
            SyncError::Cancelled => RecordErrorKind::Cancelled,
            SyncError::InvalidRequest(_) | SyncError::Protocol(_) => {
                RecordErrorKind::InvalidChange
            }
            _ => RecordErrorKind::ApplyFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::apply_failure("products", "disk full").is_retryable());
        assert!(SyncError::Store("cache offline".into()).is_retryable());
        assert!(!SyncError::not_found("batch", "b1").is_retryable());
        assert!(!SyncError::invalid_state("already resolved").is_retryable());
    }

    #[test]
    fn error_display() {
        let err = SyncError::not_found("batch", "b1");
        assert_eq!(err.to_string(), "batch not found: b1");

        let err = SyncError::capability_denied("s1", Capability::Write);
        assert_eq!(err.to_string(), "session s1 lacks the write capability");

        let err = SyncError::RetryExhausted {
            batch_id: "b1".into(),
            max_retries: 3,
        };
        assert!(err.to_string().contains("3"));
    }

    #[test]
    fn wire_codes() {
        assert_eq!(SyncError::not_found("batch", "b").code(), ErrorCode::NotFound);
        assert_eq!(
            SyncError::capability_denied("s", Capability::Read).code(),
            ErrorCode::CapabilityDenied
        );
        assert_eq!(
            SyncError::from(ProtocolError::invalid_change("c", "x")).code(),
            ErrorCode::InvalidRequest
        );
        assert_eq!(
            SyncError::from(ProtocolError::Decoding("eof".into())).code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn record_kinds() {
        assert_eq!(
            SyncError::not_found("entity type", "widgets").record_kind(),
            RecordErrorKind::NotFound
        );
        assert_eq!(
            SyncError::apply_failure("products", "bad").record_kind(),
            RecordErrorKind::ApplyFailure
        );
    }
}

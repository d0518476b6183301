//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while encoding, decoding or validating protocol values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Value could not be encoded.
    #[error("encoding failed: {0}")]
    Encoding(String),

    /// Bytes could not be decoded into the expected message.
    #[error("decoding failed: {0}")]
    Decoding(String),

    /// A change is structurally invalid.
    #[error("invalid change {change_id}: {reason}")]
    InvalidChange {
        /// Offending change id (may be empty).
        change_id: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A textual enum value is not recognised.
    #[error("unknown {kind}: {value}")]
    UnknownVariant {
        /// Which enum was being parsed.
        kind: &'static str,
        /// The rejected input.
        value: String,
    },
}

impl ProtocolError {
    /// Creates an invalid change error.
    pub fn invalid_change(change_id: impl Into<String>, reason: impl Into<String>) -> Self {
        ProtocolError::InvalidChange {
            change_id: change_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unknown variant error.
    pub fn unknown_variant(kind: &'static str, value: impl Into<String>) -> Self {
        ProtocolError::UnknownVariant {
            kind,
            value: value.into(),
        }
    }

    /// Returns true if the error came from the codec rather than validation.
    pub fn is_codec_error(&self) -> bool {
        matches!(self, ProtocolError::Encoding(_) | ProtocolError::Decoding(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::invalid_change("c1", "missing entity");
        assert_eq!(err.to_string(), "invalid change c1: missing entity");

        let err = ProtocolError::unknown_variant("operation", "upsert");
        assert_eq!(err.to_string(), "unknown operation: upsert");
    }

    #[test]
    fn codec_classification() {
        assert!(ProtocolError::Decoding("eof".into()).is_codec_error());
        assert!(!ProtocolError::invalid_change("c1", "x").is_codec_error());
    }
}

//! Error types for the sync server.

use thiserror::Error;
use tillsync_engine::SyncError;
use tillsync_protocol::{ErrorCode, ErrorResponse, ProtocolError};

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format or size.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Connection presented no usable identity.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Token missing, forged, expired or issued to another device.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// The gateway is at its connection limit.
    #[error("connection limit of {0} reached")]
    ConnectionLimit(usize),

    /// No connection with this id.
    #[error("unknown connection: {0}")]
    UnknownConnection(u64),

    /// Engine error.
    #[error(transparent)]
    Engine(#[from] SyncError),

    /// Frame could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Wire error class.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::InvalidRequest(_) => ErrorCode::InvalidRequest,
            ServerError::AuthenticationFailed(_) | ServerError::NotAuthorized(_) => {
                ErrorCode::Unauthorized
            }
            ServerError::ConnectionLimit(_) => ErrorCode::InvalidState,
            ServerError::UnknownConnection(_) => ErrorCode::NotFound,
            ServerError::Engine(e) => e.code(),
            ServerError::Protocol(ProtocolError::Encoding(_)) | ServerError::Internal(_) => {
                ErrorCode::Internal
            }
            ServerError::Protocol(_) => ErrorCode::InvalidRequest,
        }
    }

    /// Returns true if the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        !self.is_server_error()
    }

    /// Returns true if the server is at fault.
    pub fn is_server_error(&self) -> bool {
        matches!(self.code(), ErrorCode::Internal | ErrorCode::ApplyFailure)
    }

    /// Renders the error for the wire.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.code(), self.to_string())
    }
}

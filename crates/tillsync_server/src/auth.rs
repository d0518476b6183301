//! Device tokens.
//!
//! Tokens are HMAC-SHA256 signed claims that bind a connection to a device,
//! user and branch.
//!
//! ## Token Format
//!
//! - N bytes: CBOR-encoded [`TokenClaims`]
//! - 32 bytes: HMAC-SHA256 signature over the claims
//!
//! Hex-encoded for transport.

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tillsync_engine::{Clock, SystemClock};
use tillsync_protocol::{from_cbor, to_cbor};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Identity carried by a token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Device the token was issued to.
    pub device_id: String,
    /// User operating the device.
    pub user_id: String,
    /// Branch scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_id: Option<String>,
    /// Issue time (unix millis).
    pub issued_at: u64,
}

/// Issues and checks device tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
    clock: Arc<dyn Clock>,
}

impl TokenValidator {
    /// Creates a validator on the system clock.
    pub fn new(config: AuthConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a validator on the given clock.
    pub fn with_clock(config: AuthConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Creates a token for a device, issued now.
    pub fn create_token(
        &self,
        device_id: &str,
        user_id: &str,
        branch_id: Option<&str>,
    ) -> ServerResult<String> {
        self.issue(&TokenClaims {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            branch_id: branch_id.map(str::to_string),
            issued_at: self.clock.now_millis(),
        })
    }

    /// Signs arbitrary claims.
    pub fn issue(&self, claims: &TokenClaims) -> ServerResult<String> {
        let mut token = to_cbor(claims)?;
        let mut mac = self.mac()?;
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        Ok(hex::encode(token))
    }

    /// Checks signature and expiry and returns the claims.
    pub fn validate_token(&self, token: &str) -> ServerResult<TokenClaims> {
        let bytes = hex::decode(token.trim())
            .map_err(|_| ServerError::NotAuthorized("Malformed token".into()))?;
        if bytes.len() <= SIGNATURE_LEN {
            return Err(ServerError::NotAuthorized("Invalid token length".into()));
        }

        let (body, signature) = bytes.split_at(bytes.len() - SIGNATURE_LEN);
        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(signature)
            .map_err(|_| ServerError::NotAuthorized("Invalid signature".into()))?;

        let claims: TokenClaims = from_cbor(body)
            .map_err(|_| ServerError::NotAuthorized("Unreadable claims".into()))?;

        let expiry = u64::try_from(self.config.token_expiry.as_millis()).unwrap_or(u64::MAX);
        if self.clock.now_millis() > claims.issued_at.saturating_add(expiry) {
            return Err(ServerError::NotAuthorized("Token expired".into()));
        }
        Ok(claims)
    }

    /// Validates a token and checks it belongs to `device_id`.
    pub fn validate_for_device(&self, token: &str, device_id: &str) -> ServerResult<TokenClaims> {
        let claims = self.validate_token(token)?;
        if claims.device_id != device_id {
            return Err(ServerError::NotAuthorized("Device ID mismatch".into()));
        }
        Ok(claims)
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}

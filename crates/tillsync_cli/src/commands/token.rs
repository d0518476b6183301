//! Token command implementation.

use std::time::Duration;
use tillsync_server::{AuthConfig, TokenClaims, TokenValidator};

fn validator(secret: &str, expiry_hours: u64) -> Result<TokenValidator, Box<dyn std::error::Error>> {
    if secret.is_empty() {
        return Err("Secret must not be empty".into());
    }
    let config = AuthConfig::new(secret.as_bytes().to_vec())
        .with_expiry(Duration::from_secs(expiry_hours.saturating_mul(60 * 60)));
    Ok(TokenValidator::new(config))
}

/// Issues a token for a device.
pub fn issue(
    secret: &str,
    device_id: &str,
    user_id: &str,
    branch_id: Option<&str>,
) -> Result<String, Box<dyn std::error::Error>> {
    Ok(validator(secret, 24)?.create_token(device_id, user_id, branch_id)?)
}

/// Checks a token and returns its claims.
pub fn check(
    secret: &str,
    token: &str,
    device_id: Option<&str>,
    expiry_hours: u64,
) -> Result<TokenClaims, Box<dyn std::error::Error>> {
    let validator = validator(secret, expiry_hours)?;
    let claims = match device_id {
        Some(device_id) => validator.validate_for_device(token, device_id)?,
        None => validator.validate_token(token)?,
    };
    Ok(claims)
}

/// Runs `token create`.
pub fn create(
    secret: &str,
    device_id: &str,
    user_id: &str,
    branch_id: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", issue(secret, device_id, user_id, branch_id)?);
    Ok(())
}

/// Runs `token verify`.
pub fn verify(
    secret: &str,
    token: &str,
    device_id: Option<&str>,
    expiry_hours: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let claims = check(secret, token, device_id, expiry_hours)?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

//! Config command implementation.

use std::path::Path;
use tillsync_engine::EngineConfig;

/// Parses a configuration, filling omitted settings with defaults.
pub fn parse(text: &str) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let config: EngineConfig = serde_json::from_str(text)?;
    if config.max_retries == 0 && config.retry.auto_retry {
        tracing::warn!("automatic retry is enabled but max_retries is 0");
    }
    Ok(config)
}

/// Runs the config command.
///
/// Prints the effective configuration: the defaults, or the checked file
/// with defaults filled in.
pub fn run(check: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = match check {
        Some(path) => parse(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = parse(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.download_limit, EngineConfig::default().download_limit);
    }

    #[test]
    fn malformed_file_is_rejected() {
        assert!(parse(r#"{"max_retries": "many"}"#).is_err());
    }
}

//! Server configuration.

use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum concurrent real-time connections.
    pub max_connections: usize,
    /// Outbound queue length per connection.
    pub channel_capacity: usize,
    /// Whether new connections receive the recent-changes catch-up.
    pub catch_up_on_connect: bool,
    /// Maximum changes in one upload.
    pub max_upload_changes: usize,
    /// Interval of the expired-session sweeper.
    pub sweep_interval: Duration,
    /// Whether connections must present a device token.
    pub require_auth: bool,
    /// Secret key for token signing (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Token lifetime.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            max_connections: 1000,
            channel_capacity: 64,
            catch_up_on_connect: true,
            max_upload_changes: 1000,
            sweep_interval: Duration::from_secs(5 * 60),
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum concurrent connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the outbound queue length per connection.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Disables the catch-up sent on connect.
    pub fn without_catch_up(mut self) -> Self {
        self.catch_up_on_connect = false;
        self
    }

    /// Sets the maximum changes accepted in one upload.
    pub fn with_max_upload_changes(mut self, max: usize) -> Self {
        self.max_upload_changes = max;
        self
    }

    /// Sets the session sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

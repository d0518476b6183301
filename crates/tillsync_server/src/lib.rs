//! # TillSync Server
//!
//! Transport-agnostic sync server for TillSync.
//!
//! This crate provides:
//! - Request handling for every `SyncRequest` (CBOR frames in, CBOR frames out)
//! - Real-time broadcast gateway with topic subscriptions
//! - Device tokens (HMAC-SHA256)
//! - Periodic sweep of expired offline sessions
//!
//! # Architecture
//!
//! The server wraps one [`tillsync_engine::SyncEngine`]. Uploads are
//! acknowledged while the engine's worker processes them; when a batch
//! settles, the stored changes are broadcast to subscribers of the affected
//! entity and record topics, and the uploading device is told the outcome.
//!
//! # Authentication
//!
//! Authentication is optional but recommended for production:
//!
//! ```rust,ignore
//! use tillsync_server::{ServerConfig, SyncServer};
//!
//! let config = ServerConfig::default().with_auth(b"my-secure-secret".to_vec());
//! let server = SyncServer::new(engine, config);
//!
//! let token = server.tokens().unwrap().create_token("till-1", "cashier-7", Some("north"))?;
//! let (connection, outbound) = server.connect_with_token(&token)?;
//! ```
//!
//! # Real-time Channel
//!
//! 1. Device connects and receives `recent_changes` from the catch-up window
//! 2. Device subscribes to `entity` or `entity:entity_id` topics
//! 3. Server pushes `entity_update` for every stored change on those topics
//! 4. Slow devices lose messages; the producer never waits

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod gateway;
mod handler;
mod server;

pub use auth::{AuthConfig, TokenClaims, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use gateway::{BroadcastGateway, ConnectionId, ConnectionIdentity, GatewayStats, UpdateRelay};
pub use handler::RequestHandler;
pub use server::SyncServer;

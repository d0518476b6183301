//! Main sync server.

use crate::auth::{AuthConfig, TokenValidator};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::gateway::{BroadcastGateway, ConnectionId, ConnectionIdentity};
use crate::handler::RequestHandler;
use std::sync::{Arc, Weak};
use tillsync_engine::{BatchObserver, SyncEngine};
use tillsync_protocol::{
    CborCodec, ClientMessage, ServerMessage, SyncRequest, SyncResponse, SyncResult,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broadcasts the writes of settled batches and tells the uploading device.
struct GatewayNotifier {
    gateway: Weak<BroadcastGateway>,
}

impl BatchObserver for GatewayNotifier {
    fn batch_finished(&self, result: &SyncResult) {
        let Some(gateway) = self.gateway.upgrade() else {
            return;
        };
        let updates = gateway.broadcast_applied(&result.applied);
        gateway.notify_device(
            &result.device_id,
            &ServerMessage::BatchCompleted {
                batch_id: result.batch_id.clone(),
                status: result.status,
            },
        );
        debug!(batch_id = %result.batch_id, updates, "batch outcome broadcast");
    }
}

/// The sync server.
///
/// Transport-agnostic: a transport hands request frames to
/// [`handle_message`](Self::handle_message) and real-time frames to
/// [`handle_client_text`](Self::handle_client_text) or
/// [`handle_client_binary`](Self::handle_client_binary), and pumps the
/// receiver returned on connect back to the device.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use tillsync_engine::{MemoryRepository, SyncEngine};
/// use tillsync_server::{ServerConfig, SyncServer};
///
/// let engine = SyncEngine::builder()
///     .register("products", Arc::new(MemoryRepository::new("products")))
///     .build();
/// let server = SyncServer::new(Arc::new(engine), ServerConfig::default());
/// assert_eq!(server.gateway().connection_count(), 0);
/// ```
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<SyncEngine>,
    gateway: Arc<BroadcastGateway>,
    handler: RequestHandler,
    tokens: Option<TokenValidator>,
    stop: watch::Sender<bool>,
}

impl SyncServer {
    /// Creates a server over an engine and wires batch completion into the
    /// gateway.
    pub fn new(engine: Arc<SyncEngine>, config: ServerConfig) -> Self {
        let gateway = Arc::new(BroadcastGateway::new(engine.clone(), &config));
        let handler = RequestHandler::new(engine.clone(), gateway.clone(), &config);
        let tokens = config.auth_secret.clone().map(|secret| {
            TokenValidator::with_clock(
                AuthConfig::new(secret).with_expiry(config.token_expiry),
                engine.clock().clone(),
            )
        });
        engine.worker().add_observer(Arc::new(GatewayNotifier {
            gateway: Arc::downgrade(&gateway),
        }));
        let (stop, _) = watch::channel(false);

        info!(
            max_connections = config.max_connections,
            require_auth = config.require_auth,
            "sync server ready"
        );
        Self {
            config,
            engine,
            gateway,
            handler,
            tokens,
            stop,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The engine behind the server.
    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// The broadcast gateway.
    pub fn gateway(&self) -> &Arc<BroadcastGateway> {
        &self.gateway
    }

    /// Token validator, present when a secret is configured.
    pub fn tokens(&self) -> Option<&TokenValidator> {
        self.tokens.as_ref()
    }

    /// Handles a decoded request.
    pub fn handle(&self, request: SyncRequest) -> SyncResponse {
        self.handler.handle(request)
    }

    /// Handles a CBOR request frame and returns the CBOR response frame.
    ///
    /// Undecodable frames get an error response; only a failure to encode
    /// the response is returned as `Err`.
    pub fn handle_message(&self, bytes: &[u8]) -> ServerResult<Vec<u8>> {
        let response = match SyncRequest::decode(bytes) {
            Ok(request) => self.handle(request),
            Err(e) => {
                debug!(error = %e, "undecodable request frame");
                SyncResponse::Error(ServerError::from(e).to_response())
            }
        };
        Ok(response.encode()?)
    }

    /// Opens a real-time connection for a known identity.
    ///
    /// Fails with `NotAuthorized` when the server requires tokens.
    pub fn connect(
        &self,
        identity: ConnectionIdentity,
    ) -> ServerResult<(ConnectionId, mpsc::Receiver<ServerMessage>)> {
        if self.config.require_auth {
            return Err(ServerError::NotAuthorized("device token required".into()));
        }
        self.gateway.connect(identity)
    }

    /// Opens a real-time connection for the holder of a device token.
    pub fn connect_with_token(
        &self,
        token: &str,
    ) -> ServerResult<(ConnectionId, mpsc::Receiver<ServerMessage>)> {
        let validator = self
            .tokens
            .as_ref()
            .ok_or_else(|| ServerError::NotAuthorized("token auth is not configured".into()))?;
        let claims = validator.validate_token(token).inspect_err(|e| {
            warn!(error = %e, "connection token rejected");
        })?;
        self.gateway.connect(ConnectionIdentity::from(claims))
    }

    /// Closes a real-time connection.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        self.gateway.disconnect(id)
    }

    /// Handles a JSON text frame from a connection.
    ///
    /// Rejections are also queued to the connection as `error` messages.
    pub fn handle_client_text(&self, id: ConnectionId, text: &str) -> ServerResult<ServerMessage> {
        let message = ClientMessage::from_json(text).map_err(ServerError::from);
        self.handle_client(id, message)
    }

    /// Handles a CBOR binary frame from a connection.
    pub fn handle_client_binary(&self, id: ConnectionId, bytes: &[u8]) -> ServerResult<ServerMessage> {
        let message = ClientMessage::decode(bytes).map_err(ServerError::from);
        self.handle_client(id, message)
    }

    fn handle_client(
        &self,
        id: ConnectionId,
        message: ServerResult<ClientMessage>,
    ) -> ServerResult<ServerMessage> {
        let result = message.and_then(|m| self.gateway.handle_client_message(id, m));
        if let Err(e) = &result {
            if !matches!(e, ServerError::UnknownConnection(_)) {
                self.gateway.send_to(
                    id,
                    &ServerMessage::Error {
                        message: e.to_string(),
                    },
                );
            }
        }
        result
    }

    /// Starts the periodic expired-session sweep.
    ///
    /// The task ends on [`shutdown`](Self::shutdown). Must be called from
    /// within a tokio runtime.
    pub fn spawn_session_sweeper(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let period = self.config.sweep_interval;
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.sessions().sweep_expired() {
                            warn!(error = %e, "session sweep failed");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
            debug!("session sweeper stopped");
        })
    }

    /// Stops background work and closes every connection.
    pub fn shutdown(&self) {
        self.stop.send_replace(true);
        self.engine.shutdown();
        self.gateway.close_all();
        info!("sync server shut down");
    }
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("config", &self.config)
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tillsync_engine::{ManualClock, MemoryRepository, NewSession};
    use tillsync_protocol::{BatchStatus, ErrorCode, SyncChange, Topic, UploadRequest};

    fn make_server(config: ServerConfig) -> (SyncServer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(80_000_000));
        let engine = SyncEngine::builder()
            .with_clock(clock.clone())
            .register("products", Arc::new(MemoryRepository::new("products")))
            .build();
        (SyncServer::new(Arc::new(engine), config), clock)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn cbor_frames_round_the_handler() {
        let (server, _) = make_server(ServerConfig::default());
        let request = SyncRequest::Upload(UploadRequest::new(
            "till-1",
            vec![SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1)],
        ));

        let reply = server.handle_message(&request.encode().unwrap()).unwrap();
        let batch_id = match SyncResponse::decode(&reply).unwrap() {
            SyncResponse::Upload(ack) => ack.batch_id,
            other => panic!("unexpected response: {other:?}"),
        };
        let result = server.engine().worker().wait(&batch_id).await.unwrap();
        assert_eq!(result.status, BatchStatus::Completed);

        let garbage = server.handle_message(&[0xff, 0x01]).unwrap();
        match SyncResponse::decode(&garbage).unwrap() {
            SyncResponse::Error(e) => assert_eq!(e.code, ErrorCode::InvalidRequest),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn settled_batches_are_broadcast() {
        let (server, _) = make_server(ServerConfig::new().without_catch_up());
        let (uploader, mut uploader_rx) = server
            .connect(ConnectionIdentity::new("till-1", "u1"))
            .unwrap();
        let (watcher, mut watcher_rx) = server
            .connect(ConnectionIdentity::new("till-2", "u2"))
            .unwrap();
        server
            .handle_client_text(watcher, r#"{"type":"subscribe","entity":"products","entity_id":"p1"}"#)
            .unwrap();
        assert_eq!(
            drain(&mut watcher_rx),
            vec![ServerMessage::Subscribed {
                topic: Topic::record("products", "p1")
            }]
        );

        let change = SyncChange::create("products", Some("p1".into()), json!({"name": "Tea"}), 1)
            .with_origin_user("u1");
        let batch_id = match server.handle(SyncRequest::Upload(UploadRequest::new("till-1", vec![change]))) {
            SyncResponse::Upload(ack) => ack.batch_id,
            other => panic!("unexpected response: {other:?}"),
        };
        server.engine().worker().wait(&batch_id).await.unwrap();

        match drain(&mut watcher_rx).as_slice() {
            [ServerMessage::EntityUpdate(update)] => {
                assert_eq!(update.entity_id.as_deref(), Some("p1"));
                assert_eq!(update.source_user_id.as_deref(), Some("u1"));
            }
            other => panic!("unexpected messages: {other:?}"),
        }
        assert_eq!(
            drain(&mut uploader_rx),
            vec![ServerMessage::BatchCompleted {
                batch_id,
                status: BatchStatus::Completed
            }]
        );
        assert!(server.disconnect(uploader));
    }

    #[test]
    fn bad_frames_are_answered_with_errors() {
        let (server, _) = make_server(ServerConfig::default());
        let (id, mut rx) = server.connect(ConnectionIdentity::new("till-1", "u1")).unwrap();

        assert!(server.handle_client_text(id, "{not json").is_err());
        assert!(server.handle_client_binary(id, &[0x00]).is_err());
        let errors = drain(&mut rx);
        assert_eq!(errors.len(), 2);
        assert!(errors
            .iter()
            .all(|m| matches!(m, ServerMessage::Error { .. })));

        let ping = ClientMessage::Ping { timestamp: 1 }.encode().unwrap();
        assert!(matches!(
            server.handle_client_binary(id, &ping).unwrap(),
            ServerMessage::Pong { .. }
        ));
        assert!(matches!(
            server.handle_client_text(42, r#"{"type":"ping","timestamp":1}"#),
            Err(ServerError::UnknownConnection(42))
        ));
    }

    #[test]
    fn token_auth_gates_connections() {
        let config = ServerConfig::new()
            .with_auth(b"server-secret".to_vec())
            .with_token_expiry(Duration::from_secs(60));
        let (server, clock) = make_server(config);

        assert!(matches!(
            server.connect(ConnectionIdentity::new("till-1", "u1")),
            Err(ServerError::NotAuthorized(_))
        ));

        let token = server
            .tokens()
            .unwrap()
            .create_token("till-1", "u1", Some("north"))
            .unwrap();
        let (id, _rx) = server.connect_with_token(&token).unwrap();
        let identity = server.gateway().identity(id).unwrap();
        assert_eq!(identity.branch_id.as_deref(), Some("north"));

        assert!(server.connect_with_token("deadbeef").is_err());
        clock.advance(Duration::from_secs(61));
        assert!(server.connect_with_token(&token).is_err());
    }

    #[test]
    fn tokens_without_secret_are_refused() {
        let (server, _) = make_server(ServerConfig::default());
        assert!(server.tokens().is_none());
        assert!(matches!(
            server.connect_with_token("00"),
            Err(ServerError::NotAuthorized(_))
        ));
    }

    #[tokio::test]
    async fn sweeper_expires_sessions_until_shutdown() {
        let config = ServerConfig::new().with_sweep_interval(Duration::from_millis(10));
        let (server, clock) = make_server(config);
        let session = server
            .engine()
            .sessions()
            .create_session(NewSession::new("till-1", "u1").with_max_offline_hours(1))
            .unwrap();
        clock.advance(Duration::from_secs(61 * 60));

        let sweeper = server.spawn_session_sweeper();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server
            .engine()
            .sessions()
            .get_device_sessions(&session.device_id)
            .unwrap()
            .is_empty());

        server.shutdown();
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.gateway().connection_count(), 0);
    }
}

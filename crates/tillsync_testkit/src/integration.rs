//! Cross-crate integration test helpers.
//!
//! Puts a [`SyncServer`] in front of a [`TestEngine`] and hands out
//! connections whose outbound queues can be drained synchronously.

use crate::fixtures::TestEngine;
use std::sync::Arc;
use tillsync_protocol::{
    ServerMessage, SyncRequest, SyncResponse, SyncResult, Topic, UploadRequest,
};
use tillsync_server::{ConnectionId, ConnectionIdentity, ServerConfig, SyncServer};
use tokio::sync::mpsc;

/// A device on the real-time channel.
pub struct TestConnection {
    /// Gateway connection id.
    pub id: ConnectionId,
    receiver: mpsc::Receiver<ServerMessage>,
}

impl TestConnection {
    /// Every message queued so far.
    pub fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.receiver.try_recv() {
            messages.push(message);
        }
        messages
    }

    /// Entity updates queued so far, as `entity:entity_id` keys.
    pub fn updated_keys(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|message| match message {
                ServerMessage::EntityUpdate(update) => Some(match update.entity_id {
                    Some(id) => format!("{}:{}", update.entity, id),
                    None => update.entity,
                }),
                _ => None,
            })
            .collect()
    }
}

/// A test harness for server-level scenarios.
pub struct ServerHarness {
    /// Engine fixture behind the server.
    pub fixture: TestEngine,
    /// The server.
    pub server: SyncServer,
}

impl ServerHarness {
    /// Creates a harness over the point-of-sale fixture.
    pub fn new(config: ServerConfig) -> Self {
        let fixture = TestEngine::pos();
        let server = SyncServer::new(Arc::clone(&fixture.engine), config);
        Self { fixture, server }
    }

    /// Connects a device.
    pub fn connect(&self, device_id: &str, user_id: &str) -> TestConnection {
        let (id, receiver) = self
            .server
            .connect(ConnectionIdentity::new(device_id, user_id))
            .expect("Failed to connect");
        TestConnection { id, receiver }
    }

    /// Subscribes a connection to an entity or record topic.
    pub fn subscribe(&self, connection: &TestConnection, entity: &str, entity_id: Option<&str>) -> Topic {
        self.server
            .gateway()
            .subscribe(connection.id, entity, entity_id)
            .expect("Failed to subscribe")
    }

    /// Uploads through the request handler and waits for the worker.
    ///
    /// Must be awaited inside a tokio runtime.
    pub async fn upload_and_wait(&self, upload: UploadRequest) -> SyncResult {
        let batch_id = match self.server.handle(SyncRequest::Upload(upload)) {
            SyncResponse::Upload(ack) => ack.batch_id,
            other => panic!("upload rejected: {other:?}"),
        };
        self.server
            .engine()
            .worker()
            .wait(&batch_id)
            .await
            .expect("Failed to wait for batch")
    }
}

impl Default for ServerHarness {
    fn default() -> Self {
        Self::new(ServerConfig::new().without_catch_up())
    }
}

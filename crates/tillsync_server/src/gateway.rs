//! Real-time broadcast gateway.
//!
//! Keeps the process-local registry of connected devices and their topic
//! subscriptions. Every connection owns a bounded outbound queue; sends
//! never block, so a slow consumer loses messages instead of stalling the
//! producer.

use crate::auth::TokenClaims;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tillsync_engine::{ScopeFilter, SyncEngine};
use tillsync_protocol::{AppliedChange, ClientMessage, EntityUpdate, ServerMessage, Topic};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

/// Gateway-assigned connection id.
pub type ConnectionId = u64;

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// Device id.
    pub device_id: String,
    /// User id.
    pub user_id: String,
    /// Branch scope for catch-up and `request_update`.
    pub branch_id: Option<String>,
}

impl ConnectionIdentity {
    /// Creates an identity without a branch.
    pub fn new(device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            user_id: user_id.into(),
            branch_id: None,
        }
    }

    /// Sets the branch.
    pub fn with_branch(mut self, branch_id: impl Into<String>) -> Self {
        self.branch_id = Some(branch_id.into());
        self
    }

    fn check(&self) -> ServerResult<()> {
        if self.device_id.trim().is_empty() || self.user_id.trim().is_empty() {
            return Err(ServerError::AuthenticationFailed(
                "connection requires a device and a user".into(),
            ));
        }
        Ok(())
    }
}

impl From<TokenClaims> for ConnectionIdentity {
    fn from(claims: TokenClaims) -> Self {
        Self {
            device_id: claims.device_id,
            user_id: claims.user_id,
            branch_id: claims.branch_id,
        }
    }
}

/// Forwards local broadcasts to other gateway instances.
///
/// The receiving side hands relayed updates to
/// [`BroadcastGateway::receive_remote`].
pub trait UpdateRelay: Send + Sync {
    /// Publishes an update that was just delivered locally.
    fn publish(&self, update: &EntityUpdate);
}

/// Gateway counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatewayStats {
    /// Open connections.
    pub connections: usize,
    /// Topics with at least one subscriber.
    pub topics: usize,
    /// Messages queued to connections.
    pub delivered: u64,
    /// Messages dropped on full queues.
    pub dropped: u64,
}

struct Connection {
    identity: ConnectionIdentity,
    sender: mpsc::Sender<ServerMessage>,
    topics: BTreeSet<Topic>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    topics: HashMap<Topic, BTreeSet<ConnectionId>>,
}

impl Registry {
    fn unlink(&mut self, id: ConnectionId, topic: &Topic) {
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }
}

/// Pushes change notifications to connected devices.
pub struct BroadcastGateway {
    engine: Arc<SyncEngine>,
    max_connections: usize,
    channel_capacity: usize,
    catch_up_on_connect: bool,
    next_id: AtomicU64,
    registry: RwLock<Registry>,
    relay: RwLock<Option<Arc<dyn UpdateRelay>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl BroadcastGateway {
    /// Creates a gateway reading catch-up data from `engine`.
    pub fn new(engine: Arc<SyncEngine>, config: &ServerConfig) -> Self {
        Self {
            engine,
            max_connections: config.max_connections,
            channel_capacity: config.channel_capacity.max(1),
            catch_up_on_connect: config.catch_up_on_connect,
            next_id: AtomicU64::new(1),
            registry: RwLock::new(Registry::default()),
            relay: RwLock::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Installs the relay used for multi-instance fan-out.
    pub fn set_relay(&self, relay: Arc<dyn UpdateRelay>) {
        *self.relay.write() = Some(relay);
    }

    /// Registers a connection and returns its outbound queue.
    ///
    /// Changes from the recent-changes window are queued straight away when
    /// catch-up is enabled. Catch-up failures are logged and skipped.
    pub fn connect(
        &self,
        identity: ConnectionIdentity,
    ) -> ServerResult<(ConnectionId, mpsc::Receiver<ServerMessage>)> {
        identity.check()?;
        let (sender, receiver) = mpsc::channel(self.channel_capacity);

        let id = {
            let mut registry = self.registry.write();
            if registry.connections.len() >= self.max_connections {
                warn!(device_id = %identity.device_id, "connection limit reached");
                return Err(ServerError::ConnectionLimit(self.max_connections));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            registry.connections.insert(
                id,
                Connection {
                    identity: identity.clone(),
                    sender,
                    topics: BTreeSet::new(),
                },
            );
            id
        };
        info!(
            connection_id = id,
            device_id = %identity.device_id,
            user_id = %identity.user_id,
            "connection opened"
        );

        if self.catch_up_on_connect {
            self.send_catch_up(id, &identity);
        }
        Ok((id, receiver))
    }

    fn send_catch_up(&self, id: ConnectionId, identity: &ConnectionIdentity) {
        let scope = ScopeFilter::branch(identity.branch_id.as_deref());
        match self.engine.recent_changes(&scope) {
            Ok(page) if !page.changes.is_empty() => {
                let now = self.engine.clock().now_millis();
                let window = u64::try_from(self.engine.config().recent_changes_window.as_millis())
                    .unwrap_or(u64::MAX);
                let message = ServerMessage::RecentChanges {
                    changes: page.changes,
                    since: now.saturating_sub(window),
                    timestamp: now,
                };
                self.deliver(&[id], &message);
            }
            Ok(_) => {}
            Err(e) => warn!(connection_id = id, error = %e, "catch-up skipped"),
        }
    }

    /// Removes a connection and all of its subscriptions.
    ///
    /// Returns false if the connection was already gone.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let mut registry = self.registry.write();
        let Some(connection) = registry.connections.remove(&id) else {
            return false;
        };
        for topic in &connection.topics {
            registry.unlink(id, topic);
        }
        info!(
            connection_id = id,
            device_id = %connection.identity.device_id,
            "connection closed"
        );
        true
    }

    /// Joins the entity topic, or the record topic when `entity_id` is given.
    ///
    /// Subscribing twice is a no-op.
    pub fn subscribe(
        &self,
        id: ConnectionId,
        entity: &str,
        entity_id: Option<&str>,
    ) -> ServerResult<Topic> {
        let topic = topic_for(entity, entity_id)?;
        let mut guard = self.registry.write();
        let registry = &mut *guard;
        let connection = registry
            .connections
            .get_mut(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        if connection.topics.insert(topic.clone()) {
            registry.topics.entry(topic.clone()).or_default().insert(id);
            debug!(connection_id = id, %topic, "subscribed");
        }
        Ok(topic)
    }

    /// Leaves a topic. Leaving a topic never joined is a no-op.
    pub fn unsubscribe(
        &self,
        id: ConnectionId,
        entity: &str,
        entity_id: Option<&str>,
    ) -> ServerResult<Topic> {
        let topic = topic_for(entity, entity_id)?;
        let mut guard = self.registry.write();
        let registry = &mut *guard;
        let connection = registry
            .connections
            .get_mut(&id)
            .ok_or(ServerError::UnknownConnection(id))?;
        if connection.topics.remove(&topic) {
            registry.unlink(id, &topic);
            debug!(connection_id = id, %topic, "unsubscribed");
        }
        Ok(topic)
    }

    /// Delivers an update locally and hands it to the relay.
    ///
    /// Returns the number of connections the update was queued to.
    pub fn broadcast_update(&self, update: EntityUpdate) -> usize {
        let delivered = self.deliver_update(&update);
        let relay = self.relay.read().clone();
        if let Some(relay) = relay {
            relay.publish(&update);
        }
        delivered
    }

    /// Delivers an update relayed from another instance.
    pub fn receive_remote(&self, update: EntityUpdate) -> usize {
        self.deliver_update(&update)
    }

    /// Broadcasts one update per stored change.
    pub fn broadcast_applied(&self, changes: &[AppliedChange]) -> usize {
        let now = self.engine.clock().now_millis();
        changes
            .iter()
            .map(|change| {
                self.broadcast_update(EntityUpdate {
                    entity: change.entity.clone(),
                    entity_id: Some(change.entity_id.clone()),
                    data: change.data.clone(),
                    timestamp: now,
                    source_user_id: change.origin_user_id.clone(),
                })
            })
            .sum()
    }

    /// Sends a message to every connection of a device.
    pub fn notify_device(&self, device_id: &str, message: &ServerMessage) -> usize {
        let targets: Vec<ConnectionId> = self
            .registry
            .read()
            .connections
            .iter()
            .filter(|(_, c)| c.identity.device_id == device_id)
            .map(|(id, _)| *id)
            .collect();
        self.deliver(&targets, message)
    }

    /// Applies a client message and queues the reply on the connection.
    pub fn handle_client_message(
        &self,
        id: ConnectionId,
        message: ClientMessage,
    ) -> ServerResult<ServerMessage> {
        let reply = match message {
            ClientMessage::Subscribe { entity, entity_id } => ServerMessage::Subscribed {
                topic: self.subscribe(id, &entity, entity_id.as_deref())?,
            },
            ClientMessage::Unsubscribe { entity, entity_id } => ServerMessage::Unsubscribed {
                topic: self.unsubscribe(id, &entity, entity_id.as_deref())?,
            },
            ClientMessage::RequestUpdate {
                entity,
                entity_id,
                last_sync_time,
            } => {
                let identity = self.identity(id)?;
                let mut changes = self.engine.feed().read_entity(
                    &entity,
                    last_sync_time,
                    &ScopeFilter::branch(identity.branch_id.as_deref()),
                    self.engine.config().download_limit,
                )?;
                if let Some(wanted) = entity_id.as_deref() {
                    changes.retain(|c| c.entity_id.as_deref() == Some(wanted));
                }
                ServerMessage::UpdateData {
                    entity,
                    entity_id,
                    changes,
                    timestamp: self.engine.clock().now_millis(),
                }
            }
            ClientMessage::Ping { .. } => {
                self.identity(id)?;
                ServerMessage::Pong {
                    timestamp: self.engine.clock().now_millis(),
                }
            }
        };
        self.deliver(&[id], &reply);
        Ok(reply)
    }

    /// Queues a message on one connection.
    pub fn send_to(&self, id: ConnectionId, message: &ServerMessage) -> bool {
        self.deliver(&[id], message) == 1
    }

    /// Identity captured when the connection opened.
    pub fn identity(&self, id: ConnectionId) -> ServerResult<ConnectionIdentity> {
        self.registry
            .read()
            .connections
            .get(&id)
            .map(|c| c.identity.clone())
            .ok_or(ServerError::UnknownConnection(id))
    }

    /// Connections subscribed to a topic.
    pub fn subscribers(&self, topic: &Topic) -> Vec<ConnectionId> {
        self.registry
            .read()
            .topics
            .get(topic)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.registry.read().connections.len()
    }

    /// Current counters.
    pub fn stats(&self) -> GatewayStats {
        let registry = self.registry.read();
        GatewayStats {
            connections: registry.connections.len(),
            topics: registry.topics.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    /// Drops every connection, closing their queues.
    pub fn close_all(&self) -> usize {
        let mut registry = self.registry.write();
        let closed = registry.connections.len();
        registry.connections.clear();
        registry.topics.clear();
        info!(closed, "all connections closed");
        closed
    }

    fn deliver_update(&self, update: &EntityUpdate) -> usize {
        let targets: BTreeSet<ConnectionId> = {
            let registry = self.registry.read();
            Topic::fan_out(&update.entity, update.entity_id.as_deref())
                .iter()
                .filter_map(|topic| registry.topics.get(topic))
                .flatten()
                .copied()
                .collect()
        };
        let targets: Vec<ConnectionId> = targets.into_iter().collect();
        let delivered = self.deliver(&targets, &ServerMessage::EntityUpdate(update.clone()));
        debug!(
            entity = %update.entity,
            entity_id = ?update.entity_id,
            delivered,
            "entity update broadcast"
        );
        delivered
    }

    fn deliver(&self, targets: &[ConnectionId], message: &ServerMessage) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        {
            let registry = self.registry.read();
            for id in targets {
                let Some(connection) = registry.connections.get(id) else {
                    continue;
                };
                match connection.sender.try_send(message.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            connection_id = id,
                            device_id = %connection.identity.device_id,
                            "outbound queue full, message dropped"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        for id in closed {
            self.disconnect(id);
        }
        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

impl std::fmt::Debug for BroadcastGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastGateway")
            .field("stats", &self.stats())
            .field("channel_capacity", &self.channel_capacity)
            .finish()
    }
}

fn topic_for(entity: &str, entity_id: Option<&str>) -> ServerResult<Topic> {
    if entity.trim().is_empty() {
        return Err(ServerError::InvalidRequest("topic needs an entity type".into()));
    }
    if entity_id.is_some_and(|id| id.trim().is_empty()) {
        return Err(ServerError::InvalidRequest("topic entity id is empty".into()));
    }
    Ok(Topic::for_subscription(entity, entity_id))
}

//! Connection manager for tracking and managing client connections.
//!
//! The manager owns the live connection set and the three intake loops that
//! feed it:
//!
//! * **Client intake** - frames read from every WebSocket, decoded and routed
//! * **Remote intake** - envelopes addressed to this gateway on the bus
//! * **Push fan-out** - push envelopes delivered to every connection of the
//!   listed users

use super::{Connection, ConnectionId};
use crate::config::GatewayConfig;
use crate::error::RoutingError;
use crate::messaging::{RouteOutcome, Router};
use futures::StreamExt;
use meridian_core::protocol::packet;
use meridian_core::{
    BoundedQueue, Envelope, HandshakeResponse, Message, MessageType, Packet, PacketType,
};
use meridian_remote::BusStream;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// One raw frame read from a client.
#[derive(Debug, Clone)]
pub struct ClientFrame {
    pub connection_id: ConnectionId,
    pub payload: Vec<u8>,
}

/// Central manager for all client connections.
///
/// # Architecture
///
/// * Uses `RwLock<HashMap>` for connection storage; a lock is never held
///   across a send
/// * Every client frame goes through one shared inbound queue, so frames
///   from one connection are handled in arrival order
/// * Push delivery runs on its own queue and never blocks the remote intake
pub struct ConnectionManager {
    config: Arc<GatewayConfig>,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    inbound: BoundedQueue<ClientFrame>,
    push_queue: BoundedQueue<Envelope>,
    router: Arc<Router>,
}

impl ConnectionManager {
    pub fn new(config: Arc<GatewayConfig>, router: Arc<Router>) -> Self {
        Self {
            inbound: BoundedQueue::new(config.inbound_queue_capacity, config.overflow_policy),
            push_queue: BoundedQueue::new(config.push_queue_capacity, config.overflow_policy),
            connections: RwLock::new(HashMap::new()),
            config,
            router,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Registers a new, open connection and returns it.
    pub async fn add_connection(&self, remote_addr: SocketAddr) -> Arc<Connection> {
        let id = super::next_connection_id(&self.config.server_id);
        let connection = Arc::new(Connection::new(
            id.clone(),
            remote_addr,
            self.config.outbound_queue_capacity,
            self.config.overflow_policy,
        ));
        connection.advance(super::ConnectionState::Open);
        self.connections
            .write()
            .await
            .insert(id.clone(), Arc::clone(&connection));
        info!("🔗 Connection {} from {}", id, remote_addr);
        connection
    }

    /// Forgets a connection and marks it closed. Safe to call twice.
    pub async fn remove_connection(&self, connection_id: &str) -> Option<Arc<Connection>> {
        let removed = self.connections.write().await.remove(connection_id);
        if let Some(connection) = &removed {
            connection.close();
            connection.advance(super::ConnectionState::Closed);
            info!(
                "❌ Connection {} closed ({} remaining)",
                connection_id,
                self.connection_count().await
            );
        }
        removed
    }

    pub async fn get(&self, connection_id: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(connection_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Live connections bound to `user_id`.
    pub async fn find_by_user(&self, user_id: &str) -> Vec<Arc<Connection>> {
        let candidates: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();
        let mut matches = Vec::new();
        for connection in candidates {
            if connection.session().user_id().await == user_id {
                matches.push(connection);
            }
        }
        matches
    }

    /// Hands a client frame to the intake loop. False once shutting down.
    pub async fn submit(&self, frame: ClientFrame) -> bool {
        self.inbound.push(frame).await.is_ok()
    }

    /// Queues an encoded packet for one connection. False if it is gone.
    pub async fn send_to_connection(&self, connection_id: &str, packet: Vec<u8>) -> bool {
        match self.get(connection_id).await {
            Some(connection) => connection.send(packet).await.is_ok(),
            None => {
                debug!("Dropping packet for unknown connection {}", connection_id);
                false
            }
        }
    }

    /// Sends a `Kick` packet, then closes the connection once it is flushed.
    pub async fn kick(&self, connection_id: &str, reason: &str) -> bool {
        let Some(connection) = self.get(connection_id).await else {
            return false;
        };
        let body = serde_json::json!({ "reason": reason }).to_string();
        match packet::encode(PacketType::Kick, body.as_bytes()) {
            Ok(frame) => {
                let _ = connection.send(frame).await;
            }
            Err(e) => warn!("Failed to encode kick for {}: {}", connection_id, e),
        }
        connection.close();
        info!("👢 Kicked {}: {}", connection_id, reason);
        true
    }

    /// Handles one decoded client packet.
    pub async fn route_event(
        &self,
        packet: Packet,
        connection: &Connection,
    ) -> Result<(), RoutingError> {
        match packet.kind {
            PacketType::Handshake => {
                let body = serde_json::to_vec(&HandshakeResponse::ok(self.config.heartbeat_secs))?;
                let _ = connection
                    .send(packet::encode(PacketType::Handshake, &body)?)
                    .await;
                debug!("🤝 Handshake with {}", connection.id);
            }
            PacketType::HandshakeAck => {
                debug!("Handshake acknowledged by {}", connection.id);
            }
            PacketType::Heartbeat => {
                trace!("💓 Heartbeat from {}", connection.id);
                let _ = connection
                    .send(packet::encode(PacketType::Heartbeat, &[])?)
                    .await;
            }
            PacketType::Data => {
                let message = packet.message()?;
                if let RouteOutcome::Reply(reply) = self.router.dispatch(message, connection).await? {
                    let _ = connection
                        .send(packet::encode(PacketType::Data, &reply.encode()?)?)
                        .await;
                }
            }
            PacketType::Kick => {
                info!("Client {} sent a kick packet", connection.id);
            }
        }
        Ok(())
    }

    /// Applies one envelope received from the bus.
    pub async fn deliver_remote(&self, envelope: Envelope) {
        let Some(connection) = self.get(&envelope.connection_id).await else {
            if envelope.body_type() == Some(MessageType::Push) {
                self.enqueue_push(envelope).await;
            } else {
                debug!("Envelope for departed connection {}", envelope.connection_id);
            }
            return;
        };

        if envelope.is_session_sync() {
            let applied = connection
                .session()
                .merge(&envelope.user_id, envelope.session_data)
                .await;
            if !applied {
                debug!("Stale session sync for {} ignored", envelope.connection_id);
            }
            return;
        }

        match envelope.body {
            Some(body) if matches!(body.kind, MessageType::Request | MessageType::Response) => {
                let response = Message {
                    kind: MessageType::Response,
                    ..body
                };
                match response.encode().and_then(|m| packet::encode(PacketType::Data, &m)) {
                    Ok(frame) => {
                        let _ = connection.send(frame).await;
                    }
                    Err(e) => warn!("Failed to encode response for {}: {}", connection.id, e),
                }
            }
            Some(body) if body.kind == MessageType::Push => {
                self.enqueue_push(Envelope {
                    body: Some(body),
                    ..envelope
                })
                .await;
            }
            _ => debug!("Ignoring envelope without deliverable body from {}", envelope.src),
        }
    }

    async fn enqueue_push(&self, envelope: Envelope) {
        if self.push_queue.push(envelope).await.is_err() {
            debug!("Push dropped: gateway shutting down");
        }
    }

    /// Sends a push envelope to every connection bound to one of its users.
    /// Returns the number of connections it was queued for.
    pub async fn broadcast_push(&self, envelope: &Envelope) -> usize {
        let Some(body) = &envelope.body else {
            return 0;
        };
        let frame = match body.encode().and_then(|m| packet::encode(PacketType::Data, &m)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode push {}: {}", body.route, e);
                return 0;
            }
        };

        let users: HashSet<&str> = envelope.push_user_ids.iter().map(String::as_str).collect();
        let candidates: Vec<Arc<Connection>> =
            self.connections.read().await.values().cloned().collect();

        let mut delivered = 0;
        for connection in candidates {
            let user_id = connection.session().user_id().await;
            if user_id.is_empty() || !users.contains(user_id.as_str()) {
                continue;
            }
            if connection.send(frame.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        debug!("📡 Push {} delivered to {} connection(s)", body.route, delivered);
        delivered
    }

    /// Spawns the client, remote and push intake loops.
    pub fn start(self: &Arc<Self>, remote_inbox: BusStream) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::clone(self).client_intake()),
            tokio::spawn(Arc::clone(self).remote_intake(remote_inbox)),
            tokio::spawn(Arc::clone(self).push_intake()),
        ]
    }

    async fn client_intake(self: Arc<Self>) {
        while let Some(frame) = self.inbound.pop().await {
            let Some(connection) = self.get(&frame.connection_id).await else {
                continue;
            };
            let packet = match packet::decode(&frame.payload) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("⚠️ Bad frame from {}: {}", frame.connection_id, e);
                    continue;
                }
            };
            if let Err(e) = self.route_event(packet, &connection).await {
                warn!("❌ Message from {} not handled: {}", frame.connection_id, e);
            }
        }
        debug!("Client intake stopped");
    }

    async fn remote_intake(self: Arc<Self>, mut inbox: BusStream) {
        while let Some(bytes) = inbox.next().await {
            match Envelope::from_bytes(&bytes) {
                Ok(envelope) => self.deliver_remote(envelope).await,
                Err(e) => warn!("⚠️ Discarding undecodable envelope: {}", e),
            }
        }
        debug!("Remote intake stopped");
    }

    async fn push_intake(self: Arc<Self>) {
        while let Some(envelope) = self.push_queue.pop().await {
            self.broadcast_push(&envelope).await;
        }
        debug!("Push intake stopped");
    }

    /// Stops the intake queues and closes every connection.
    pub async fn close_all(&self) {
        self.inbound.close();
        self.push_queue.close();
        let connections: Vec<Arc<Connection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in &connections {
            connection.close();
        }
        info!("🔌 Closed {} connection(s)", connections.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::UniformRandom;
    use meridian_core::SessionData;
    use meridian_discovery::InstanceTable;
    use meridian_remote::LocalBus;
    use serde_json::json;

    fn manager() -> ConnectionManager {
        let config = Arc::new(GatewayConfig::default());
        let router = Router::new(
            config.server_id.clone(),
            config.local_server_types.clone(),
            Arc::new(InstanceTable::new()),
            Arc::new(LocalBus::new()),
            Box::new(UniformRandom),
        );
        ConnectionManager::new(config, Arc::new(router))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    #[tokio::test]
    async fn add_and_remove_connections() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        assert!(conn.is_open());
        assert_eq!(manager.connection_count().await, 1);

        let removed = manager.remove_connection(&conn.id).await.unwrap();
        assert_eq!(removed.state(), crate::connection::ConnectionState::Closed);
        assert_eq!(manager.connection_count().await, 0);
        assert!(manager.remove_connection(&conn.id).await.is_none());
    }

    #[tokio::test]
    async fn heartbeat_is_echoed() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        manager
            .route_event(Packet::new(PacketType::Heartbeat, vec![]), &conn)
            .await
            .unwrap();
        assert_eq!(conn.next_outbound().await, Some(vec![3, 0, 0, 0]));
    }

    #[tokio::test]
    async fn handshake_advertises_heartbeat() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        manager
            .route_event(Packet::new(PacketType::Handshake, b"{}".to_vec()), &conn)
            .await
            .unwrap();
        let reply = packet::decode(&conn.next_outbound().await.unwrap()).unwrap();
        assert_eq!(reply.kind, PacketType::Handshake);
        let body: serde_json::Value = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(body, json!({ "code": 200, "sys": { "heartbeat": 3 } }));
    }

    #[tokio::test]
    async fn remote_reply_reaches_the_connection_as_response() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        let envelope = Envelope {
            src: "hall-1".into(),
            dst: "connector-1".into(),
            connection_id: conn.id.clone(),
            body: Some(Message::request(9, "hall.userHandler.info", b"{}".to_vec())),
            ..Default::default()
        };
        manager.deliver_remote(envelope).await;

        let frame = packet::decode(&conn.next_outbound().await.unwrap()).unwrap();
        let message = frame.message().unwrap();
        assert_eq!(message.kind, MessageType::Response);
        assert_eq!(message.id, 9);
    }

    #[tokio::test]
    async fn session_sync_merges_only_for_bound_user() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        conn.session().bind_user("u1").await;

        let mut changes = SessionData::new();
        changes.insert("room".into(), json!("r1"));
        manager
            .deliver_remote(Envelope::session_sync(
                "hall-1",
                "connector-1",
                conn.id.clone(),
                "someone-else",
                changes.clone(),
            ))
            .await;
        assert_eq!(conn.session().get("room").await, None);

        manager
            .deliver_remote(Envelope::session_sync(
                "hall-1",
                "connector-1",
                conn.id.clone(),
                "u1",
                changes,
            ))
            .await;
        assert_eq!(conn.session().get("room").await, Some(json!("r1")));
        assert_eq!(conn.pending(), 0);
    }

    #[tokio::test]
    async fn push_reaches_every_connection_of_listed_users() {
        let manager = manager();
        let a = manager.add_connection(addr()).await;
        let b = manager.add_connection(addr()).await;
        let c = manager.add_connection(addr()).await;
        let anonymous = manager.add_connection(addr()).await;
        a.session().bind_user("u1").await;
        b.session().bind_user("u1").await;
        c.session().bind_user("u2").await;

        let envelope = Envelope {
            body: Some(Message::push("onChat", b"\"hi\"".to_vec())),
            push_user_ids: vec!["u1".into(), "".into(), "nobody".into()],
            ..Default::default()
        };
        assert_eq!(manager.broadcast_push(&envelope).await, 2);

        for conn in [&a, &b] {
            let message = packet::decode(&conn.next_outbound().await.unwrap())
                .unwrap()
                .message()
                .unwrap();
            assert_eq!(message.kind, MessageType::Push);
            assert_eq!(message.route, "onChat");
        }
        assert_eq!(c.pending(), 0);
        assert_eq!(anonymous.pending(), 0);
        assert_eq!(manager.find_by_user("u1").await.len(), 2);
    }

    #[tokio::test]
    async fn kick_sends_reason_then_closes() {
        let manager = manager();
        let conn = manager.add_connection(addr()).await;
        assert!(manager.kick(&conn.id, "duplicate login").await);

        let frame = packet::decode(&conn.next_outbound().await.unwrap()).unwrap();
        assert_eq!(frame.kind, PacketType::Kick);
        let body: serde_json::Value = serde_json::from_slice(&frame.body).unwrap();
        assert_eq!(body["reason"], "duplicate login");
        assert_eq!(conn.next_outbound().await, None);
        assert!(!manager.kick("missing", "x").await);
    }
}

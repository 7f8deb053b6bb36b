//! Client connection representation.

use super::{ConnectionId, Session};
use meridian_core::{BoundedQueue, OverflowPolicy, QueueClosed};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(10_000);

/// Allocates a process-unique connection id.
pub fn next_connection_id(server_id: &str) -> ConnectionId {
    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{}-{}-{}", uuid::Uuid::new_v4(), server_id, counter)
}

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// One WebSocket client.
///
/// Everything written to the client goes through `outbound`, drained by a
/// single write pump, so per-connection order is preserved. Closing the
/// queue is how the pumps are told to stop.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_addr: SocketAddr,
    pub connected_at: SystemTime,
    state: AtomicU8,
    session: Arc<Session>,
    outbound: BoundedQueue<Vec<u8>>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound_capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            session: Arc::new(Session::new(id.clone())),
            id,
            remote_addr,
            connected_at: SystemTime::now(),
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            outbound: BoundedQueue::new(outbound_capacity, policy),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Advances the state. Returns false if `next` would move backwards.
    pub fn advance(&self, next: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Queues an encoded packet for the client.
    pub async fn send(&self, packet: Vec<u8>) -> Result<(), QueueClosed<Vec<u8>>> {
        self.outbound.push(packet).await
    }

    /// Next packet for the write pump; `None` once closed and drained.
    pub async fn next_outbound(&self) -> Option<Vec<u8>> {
        self.outbound.pop().await
    }

    /// Packets queued but not yet written.
    pub fn pending(&self) -> usize {
        self.outbound.len()
    }

    /// Starts closing: queued packets are still flushed, new ones rejected.
    pub fn close(&self) {
        self.advance(ConnectionState::Closing);
        self.outbound.close();
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}

//! Gateway configuration types and defaults.
//!
//! The gateway is configured once through [`GatewayConfig`] and the value is
//! shared read-only by the server, the connection manager and the router.

use crate::messaging::balancer::BalancerKind;
use crate::error::ServerError;
use meridian_core::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for one gateway process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// The socket address to accept WebSocket clients on
    pub bind_address: SocketAddr,

    /// Process id of this gateway; also its bus subject
    pub server_id: String,

    /// Heartbeat interval advertised to clients in the handshake, in seconds
    pub heartbeat_secs: u64,

    /// A connection that sends nothing for this long is closed, in milliseconds
    pub pong_wait_ms: u64,

    /// Larger inbound frames are dropped
    pub max_message_size: usize,

    /// Capacity of the shared client-inbound queue
    pub inbound_queue_capacity: usize,

    /// Capacity of each connection's outbound queue
    pub outbound_queue_capacity: usize,

    /// Capacity of the push fan-out queue
    pub push_queue_capacity: usize,

    /// What full queues do with new items
    pub overflow_policy: OverflowPolicy,

    /// Server types whose handlers run inside the gateway itself
    pub local_server_types: Vec<String>,

    /// How a destination is picked among instances of a server type
    pub load_balancer: BalancerKind,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:12000".parse().expect("Invalid default bind address"),
            server_id: "connector-1".to_string(),
            heartbeat_secs: 3,
            pong_wait_ms: 10_000,
            max_message_size: 1024,
            inbound_queue_capacity: 1024,
            outbound_queue_capacity: 1024,
            push_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
            local_server_types: vec!["connector".to_string()],
            load_balancer: BalancerKind::default(),
        }
    }
}

impl GatewayConfig {
    pub fn pong_wait(&self) -> Duration {
        Duration::from_millis(self.pong_wait_ms)
    }

    /// Pings go out at nine tenths of the pong wait.
    pub fn ping_interval(&self) -> Duration {
        self.pong_wait() * 9 / 10
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.server_id.is_empty() {
            return Err(ServerError::Internal("server_id must not be empty".into()));
        }
        if self.pong_wait_ms < 10 {
            return Err(ServerError::Internal(
                "pong_wait_ms must be at least 10".into(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(ServerError::Internal(
                "max_message_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keepalive_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.pong_wait(), Duration::from_secs(10));
        assert_eq!(config.ping_interval(), Duration::from_secs(9));
        assert_eq!(config.max_message_size, 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "server_id": "connector-7",
            "load_balancer": "round_robin"
        }))
        .unwrap();
        assert_eq!(config.server_id, "connector-7");
        assert_eq!(config.load_balancer, BalancerKind::RoundRobin);
        assert_eq!(config.heartbeat_secs, 3);
    }
}

//! Handshake payloads.

use serde::{Deserialize, Serialize};

/// Status code sent with a successful handshake.
pub const HANDSHAKE_OK: u16 = 200;

/// Body of the server's `Handshake` packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub code: u16,
    pub sys: HandshakeSys,
}

/// System parameters advertised to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeSys {
    /// Heartbeat interval the client should use, in seconds
    pub heartbeat: u64,
}

impl HandshakeResponse {
    pub fn ok(heartbeat_secs: u64) -> Self {
        Self {
            code: HANDSHAKE_OK,
            sys: HandshakeSys {
                heartbeat: heartbeat_secs,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_capability_descriptor() {
        let json = serde_json::to_string(&HandshakeResponse::ok(3)).unwrap();
        assert_eq!(json, r#"{"code":200,"sys":{"heartbeat":3}}"#);
    }
}

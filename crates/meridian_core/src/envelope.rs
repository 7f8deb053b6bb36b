//! Inter-process envelopes.
//!
//! An [`Envelope`] wraps a client [`Message`] with the routing metadata a
//! worker needs to answer: where it came from, which connection and user it
//! belongs to, and the session snapshot at the time it was forwarded.

use crate::protocol::message::{Message, MessageType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Session key/value snapshot carried between processes.
pub type SessionData = HashMap<String, serde_json::Value>;

/// Distinguishes application traffic from session synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    #[default]
    Normal,
    /// Carries session changes only; never dispatched, never answered
    SessionSync,
}

/// The message exchanged on the inter-process bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Process id of the sender
    pub src: String,
    /// Process id of the recipient
    pub dst: String,
    /// Handler key (`category.method`) on the recipient
    #[serde(default)]
    pub router: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Message>,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub connection_id: String,
    #[serde(default)]
    pub session_data: SessionData,
    /// Recipients of a push, matched against bound user ids by the gateway
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub push_user_ids: Vec<String>,
    #[serde(default)]
    pub kind: EnvelopeKind,
}

impl Envelope {
    /// Builds a session-sync envelope carrying `changes` back to `dst`.
    pub fn session_sync(
        src: impl Into<String>,
        dst: impl Into<String>,
        connection_id: impl Into<String>,
        user_id: impl Into<String>,
        changes: SessionData,
    ) -> Self {
        Self {
            src: src.into(),
            dst: dst.into(),
            connection_id: connection_id.into(),
            user_id: user_id.into(),
            session_data: changes,
            kind: EnvelopeKind::SessionSync,
            ..Default::default()
        }
    }

    /// Builds the reply envelope for `self`, swapping source and destination.
    pub fn reply(&self, body: Message) -> Self {
        Self {
            src: self.dst.clone(),
            dst: self.src.clone(),
            router: self.router.clone(),
            body: Some(body),
            user_id: self.user_id.clone(),
            connection_id: self.connection_id.clone(),
            ..Default::default()
        }
    }

    pub fn is_session_sync(&self) -> bool {
        self.kind == EnvelopeKind::SessionSync
    }

    /// Type of the embedded message, if any.
    pub fn body_type(&self) -> Option<MessageType> {
        self.body.as_ref().map(|body| body.kind)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_swaps_endpoints_and_keeps_identity() {
        let request = Envelope {
            src: "connector-1".into(),
            dst: "hall-2".into(),
            router: "userHandler.updateUserAddress".into(),
            body: Some(Message::request(4, "hall.userHandler.updateUserAddress", Vec::new())),
            user_id: "u1".into(),
            connection_id: "c1".into(),
            ..Default::default()
        };
        let reply = request.reply(Message::default());
        assert_eq!(reply.src, "hall-2");
        assert_eq!(reply.dst, "connector-1");
        assert_eq!(reply.user_id, "u1");
        assert_eq!(reply.connection_id, "c1");
        assert!(!reply.is_session_sync());
    }

    #[test]
    fn session_sync_wire_shape() {
        let mut changes = SessionData::new();
        changes.insert("roomId".into(), json!("r-9"));
        let env = Envelope::session_sync("hall-2", "connector-1", "c1", "u1", changes);
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["kind"], "session_sync");
        assert_eq!(value["connectionId"], "c1");
        assert_eq!(value["sessionData"]["roomId"], "r-9");
        assert!(value.get("body").is_none());
        assert!(value.get("pushUserIds").is_none());
    }

    #[test]
    fn tolerates_sparse_payloads() {
        let env = Envelope::from_bytes(br#"{"src":"a","dst":"b"}"#).unwrap();
        assert_eq!(env.kind, EnvelopeKind::Normal);
        assert!(env.body.is_none());
        assert!(env.session_data.is_empty());
    }
}

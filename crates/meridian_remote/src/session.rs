//! Worker-side view of a gateway session.
//!
//! A [`RemoteSession`] is rebuilt for every forwarded envelope from the
//! session snapshot it carries. Writes update the local copy at once and are
//! sent back to the gateway as session-sync envelopes; the gateway merges
//! them key by key.

use meridian_core::{BoundedQueue, Envelope, Message, SessionData};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

pub struct RemoteSession {
    process_id: String,
    gateway: String,
    connection_id: String,
    user_id: String,
    data: RwLock<SessionData>,
    outbox: Arc<BoundedQueue<Envelope>>,
}

impl RemoteSession {
    /// Builds the session for `origin`, sending follow-ups through `outbox`.
    pub fn new(origin: &Envelope, process_id: impl Into<String>, outbox: Arc<BoundedQueue<Envelope>>) -> Self {
        Self {
            process_id: process_id.into(),
            gateway: origin.src.clone(),
            connection_id: origin.connection_id.clone(),
            user_id: origin.user_id.clone(),
            data: RwLock::new(origin.session_data.clone()),
            outbox,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.data.read().await.get(key).cloned()
    }

    pub async fn snapshot(&self) -> SessionData {
        self.data.read().await.clone()
    }

    /// Stores `value` locally and queues a sync of this key to the gateway.
    pub async fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        let key = key.into();
        self.data.write().await.insert(key.clone(), value.clone());

        let mut changes = SessionData::new();
        changes.insert(key, value);
        let sync = Envelope::session_sync(
            self.process_id.clone(),
            self.gateway.clone(),
            self.connection_id.clone(),
            self.user_id.clone(),
            changes,
        );
        if self.outbox.push(sync).await.is_err() {
            warn!("⚠️ Session sync for {} dropped: worker stopping", self.connection_id);
        }
    }

    /// Queues a push of `payload` on `route` to the listed users.
    ///
    /// The gateway delivers it to every live connection bound to one of them.
    pub async fn push<T: Serialize>(
        &self,
        users: Vec<String>,
        payload: &T,
        route: impl Into<String>,
    ) -> Result<(), serde_json::Error> {
        let data = serde_json::to_vec(payload)?;
        let envelope = Envelope {
            src: self.process_id.clone(),
            dst: self.gateway.clone(),
            body: Some(Message::push(route, data)),
            connection_id: self.connection_id.clone(),
            push_user_ids: users,
            ..Default::default()
        };
        debug!("Queueing push to {} user(s)", envelope.push_user_ids.len());
        if self.outbox.push(envelope).await.is_err() {
            warn!("⚠️ Push from {} dropped: worker stopping", self.process_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{EnvelopeKind, MessageType, OverflowPolicy};
    use serde_json::json;

    fn origin() -> Envelope {
        let mut session_data = SessionData::new();
        session_data.insert("level".into(), json!(3));
        Envelope {
            src: "connector-1".into(),
            dst: "hall-1".into(),
            user_id: "u1".into(),
            connection_id: "c1".into(),
            session_data,
            ..Default::default()
        }
    }

    fn session() -> (RemoteSession, Arc<BoundedQueue<Envelope>>) {
        let outbox = Arc::new(BoundedQueue::new(8, OverflowPolicy::Block));
        (RemoteSession::new(&origin(), "hall-1", outbox.clone()), outbox)
    }

    #[tokio::test]
    async fn seeded_from_envelope() {
        let (session, _) = session();
        assert_eq!(session.user_id(), "u1");
        assert_eq!(session.get("level").await, Some(json!(3)));
        assert_eq!(session.get("missing").await, None);
    }

    #[tokio::test]
    async fn put_syncs_only_the_changed_key() {
        let (session, outbox) = session();
        session.put("roomId", json!("r-7")).await;

        assert_eq!(session.get("roomId").await, Some(json!("r-7")));
        let sync = outbox.pop().await.unwrap();
        assert_eq!(sync.kind, EnvelopeKind::SessionSync);
        assert_eq!(sync.dst, "connector-1");
        assert_eq!(sync.src, "hall-1");
        assert_eq!(sync.user_id, "u1");
        assert_eq!(sync.session_data.len(), 1);
        assert_eq!(sync.session_data["roomId"], json!("r-7"));
    }

    #[tokio::test]
    async fn push_targets_listed_users() {
        let (session, outbox) = session();
        session
            .push(vec!["u2".into(), "u3".into()], &json!({"roomId": "r-7"}), "roomPush")
            .await
            .unwrap();

        let push = outbox.pop().await.unwrap();
        assert_eq!(push.body_type(), Some(MessageType::Push));
        assert_eq!(push.push_user_ids, vec!["u2", "u3"]);
        assert_eq!(push.body.unwrap().route, "roomPush");
    }

    #[tokio::test]
    async fn writes_after_close_are_dropped() {
        let (session, outbox) = session();
        outbox.close();
        session.put("k", json!(1)).await;
        assert_eq!(session.get("k").await, Some(json!(1)));
        assert!(outbox.is_empty());
    }
}

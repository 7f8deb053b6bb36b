//! Gateway-side session state.

use super::ConnectionId;
use meridian_core::SessionData;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct SessionState {
    user_id: String,
    data: SessionData,
}

/// Per-connection key/value state plus the bound user id.
///
/// Workers change it only through session-sync envelopes, which are merged
/// key by key and only while the user id still matches.
#[derive(Debug)]
pub struct Session {
    connection_id: ConnectionId,
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(connection_id: impl Into<ConnectionId>) -> Self {
        Self {
            connection_id: connection_id.into(),
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Bound user id; empty until the client has entered.
    pub async fn user_id(&self) -> String {
        self.state.read().await.user_id.clone()
    }

    pub async fn bind_user(&self, user_id: impl Into<String>) {
        self.state.write().await.user_id = user_id.into();
    }

    pub async fn put(&self, key: impl Into<String>, value: serde_json::Value) {
        self.state.write().await.data.insert(key.into(), value);
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.state.read().await.data.get(key).cloned()
    }

    pub async fn snapshot(&self) -> SessionData {
        self.state.read().await.data.clone()
    }

    /// Merges `changes` if `user_id` is the bound user. Returns whether it did.
    pub async fn merge(&self, user_id: &str, changes: SessionData) -> bool {
        let mut state = self.state.write().await;
        if state.user_id != user_id {
            return false;
        }
        state.data.extend(changes);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn changes(pairs: &[(&str, serde_json::Value)]) -> SessionData {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn merge_requires_matching_user() {
        let session = Session::new("c1");
        session.bind_user("u1").await;

        assert!(!session.merge("u2", changes(&[("room", json!("r1"))])).await);
        assert_eq!(session.get("room").await, None);

        assert!(session.merge("u1", changes(&[("room", json!("r1"))])).await);
        assert_eq!(session.get("room").await, Some(json!("r1")));
    }

    #[tokio::test]
    async fn merge_is_per_key_last_write_wins() {
        let session = Session::new("c1");
        session.put("level", json!(1)).await;
        session.put("gold", json!(10)).await;

        session.merge("", changes(&[("level", json!(2))])).await;
        session.merge("", changes(&[("level", json!(3)), ("room", json!("r9"))])).await;

        let data = session.snapshot().await;
        assert_eq!(data["level"], json!(3));
        assert_eq!(data["gold"], json!(10));
        assert_eq!(data["room"], json!("r9"));
    }

    #[tokio::test]
    async fn merges_on_disjoint_keys_commute() {
        let a = changes(&[("x", json!(1))]);
        let b = changes(&[("y", json!(2))]);

        let first = Session::new("c1");
        first.merge("", a.clone()).await;
        first.merge("", b.clone()).await;

        let second = Session::new("c2");
        second.merge("", b).await;
        second.merge("", a).await;

        assert_eq!(first.snapshot().await, second.snapshot().await);
    }
}

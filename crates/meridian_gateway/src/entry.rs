//! The `entryHandler.entry` handler served by the gateway itself.
//!
//! A client enters by sending `{token, userInfo}`. The token is exchanged for
//! a user id, the user record is found or created, and the user id is bound
//! to the connection's session. Every outcome is answered with `{code, msg}`;
//! only `code == 200` means the session is now bound.

use crate::connection::Session;
use crate::error::EntryError;
use crate::messaging::Router;
use async_trait::async_trait;
use meridian_remote::HandlerError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_REQUEST: u16 = 400;
pub const CODE_BAD_TOKEN: u16 = 401;
pub const CODE_STORAGE: u16 = 500;

const DEFAULT_AVATAR: &str = "common/head_icon_default";

/// Exchanges a client token for a user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, EntryError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find(&self, user_id: &str) -> Result<Option<UserRecord>, EntryError>;
    async fn insert(&self, user: UserRecord) -> Result<(), EntryError>;
    async fn update(&self, user: UserRecord) -> Result<(), EntryError>;
}

/// Profile hints a client may send on first entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInfo {
    pub nickname: String,
    pub avatar: String,
    pub sex: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub uid: String,
    pub nickname: String,
    pub avatar: String,
    pub sex: i32,
    pub gold: i64,
    pub create_time: u64,
    pub last_login_time: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRequest {
    token: String,
    #[serde(default)]
    user_info: UserInfo,
}

/// The `{code, msg}` reply shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryReply {
    pub code: u16,
    #[serde(default)]
    pub msg: serde_json::Value,
}

impl EntryReply {
    pub fn fail(code: u16) -> Self {
        Self {
            code,
            msg: serde_json::Value::Null,
        }
    }

    pub fn success(msg: serde_json::Value) -> Self {
        Self { code: CODE_OK, msg }
    }
}

/// Token table held in memory: each known token maps to one user id.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new<I, T, U>(tokens: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, uid)| (token.into(), uid.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, EntryError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(EntryError::InvalidToken)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<String, UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find(&self, user_id: &str) -> Result<Option<UserRecord>, EntryError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }

    async fn insert(&self, user: UserRecord) -> Result<(), EntryError> {
        let mut users = self.users.write().await;
        if users.contains_key(&user.uid) {
            return Err(EntryError::DuplicateUser(user.uid));
        }
        users.insert(user.uid.clone(), user);
        Ok(())
    }

    async fn update(&self, user: UserRecord) -> Result<(), EntryError> {
        match self.users.write().await.get_mut(&user.uid) {
            Some(existing) => {
                *existing = user;
                Ok(())
            }
            None => Err(EntryError::Storage(format!("user {} not found", user.uid))),
        }
    }
}

pub struct EntryHandler {
    verifier: Arc<dyn TokenVerifier>,
    users: Arc<dyn UserStore>,
    start_gold: i64,
}

impl EntryHandler {
    pub const KEY: &'static str = "entryHandler.entry";

    pub fn new(verifier: Arc<dyn TokenVerifier>, users: Arc<dyn UserStore>) -> Self {
        Self {
            verifier,
            users,
            start_gold: 1000,
        }
    }

    /// Gold granted to newly created users.
    pub fn with_start_gold(mut self, gold: i64) -> Self {
        self.start_gold = gold;
        self
    }

    /// Installs this handler on `router` under [`EntryHandler::KEY`].
    pub fn install(self: Arc<Self>, router: &mut Router) {
        router.on(Self::KEY, move |session: Arc<Session>, body: Vec<u8>| {
            let handler = Arc::clone(&self);
            async move {
                let reply = handler.entry(&session, &body).await;
                Ok::<_, HandlerError>(serde_json::to_value(reply)?)
            }
        });
    }

    pub async fn entry(&self, session: &Session, body: &[u8]) -> EntryReply {
        let request: EntryRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("⚠️ Malformed entry from {}: {}", session.connection_id(), e);
                return EntryReply::fail(CODE_BAD_REQUEST);
            }
        };

        let user_id = match self.verifier.verify(&request.token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                warn!("🔒 Entry rejected for {}: {}", session.connection_id(), e);
                return EntryReply::fail(CODE_BAD_TOKEN);
            }
        };

        let user = match self.find_or_create(&user_id, request.user_info).await {
            Ok(user) => user,
            Err(e) => {
                warn!("❌ User lookup for {} failed: {}", user_id, e);
                return EntryReply::fail(CODE_STORAGE);
            }
        };

        session.bind_user(user_id.clone()).await;
        info!("🎮 User {} entered on {}", user_id, session.connection_id());
        EntryReply::success(serde_json::json!({ "userInfo": user }))
    }

    async fn find_or_create(&self, user_id: &str, info: UserInfo) -> Result<UserRecord, EntryError> {
        let now = now_millis();
        if let Some(mut user) = self.users.find(user_id).await? {
            user.last_login_time = now;
            self.users.update(user.clone()).await?;
            return Ok(user);
        }

        let user = UserRecord {
            uid: user_id.to_string(),
            nickname: non_empty(info.nickname).unwrap_or_else(|| format!("player{user_id}")),
            avatar: non_empty(info.avatar).unwrap_or_else(|| DEFAULT_AVATAR.to_string()),
            sex: info.sex,
            gold: self.start_gold,
            create_time: now,
            last_login_time: now,
        };
        self.users.insert(user.clone()).await?;
        Ok(user)
    }
}

fn non_empty(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct BrokenStore;

    #[async_trait]
    impl UserStore for BrokenStore {
        async fn find(&self, _user_id: &str) -> Result<Option<UserRecord>, EntryError> {
            Err(EntryError::Storage("offline".into()))
        }
        async fn insert(&self, _user: UserRecord) -> Result<(), EntryError> {
            Err(EntryError::Storage("offline".into()))
        }
        async fn update(&self, _user: UserRecord) -> Result<(), EntryError> {
            Err(EntryError::Storage("offline".into()))
        }
    }

    fn handler(users: Arc<dyn UserStore>) -> EntryHandler {
        EntryHandler::new(Arc::new(StaticTokenVerifier::new([("tok-1", "u1")])), users)
    }

    #[tokio::test]
    async fn first_entry_creates_user_and_binds_session() {
        let users = Arc::new(MemoryUserStore::new());
        let handler = handler(users.clone()).with_start_gold(500);
        let session = Session::new("c1");

        let body = json!({ "token": "tok-1", "userInfo": { "nickname": "ada" } });
        let reply = handler.entry(&session, body.to_string().as_bytes()).await;

        assert_eq!(reply.code, CODE_OK);
        assert_eq!(reply.msg["userInfo"]["uid"], "u1");
        assert_eq!(reply.msg["userInfo"]["nickname"], "ada");
        assert_eq!(reply.msg["userInfo"]["avatar"], DEFAULT_AVATAR);
        assert_eq!(reply.msg["userInfo"]["gold"], 500);
        assert_eq!(session.user_id().await, "u1");
        assert_eq!(users.len().await, 1);
    }

    #[tokio::test]
    async fn second_entry_reuses_the_record() {
        let users = Arc::new(MemoryUserStore::new());
        let handler = handler(users.clone());
        let body = json!({ "token": "tok-1" }).to_string();

        handler.entry(&Session::new("c1"), body.as_bytes()).await;
        let reply = handler.entry(&Session::new("c2"), body.as_bytes()).await;

        assert_eq!(reply.code, CODE_OK);
        assert_eq!(reply.msg["userInfo"]["nickname"], "playeru1");
        assert_eq!(users.len().await, 1);
    }

    #[tokio::test]
    async fn failures_map_to_codes_and_leave_session_unbound() {
        let session = Session::new("c1");

        let reply = handler(Arc::new(MemoryUserStore::new()))
            .entry(&session, b"not json")
            .await;
        assert_eq!(reply, EntryReply::fail(CODE_BAD_REQUEST));

        let reply = handler(Arc::new(MemoryUserStore::new()))
            .entry(&session, br#"{"token":"forged"}"#)
            .await;
        assert_eq!(reply.code, CODE_BAD_TOKEN);

        let reply = handler(Arc::new(BrokenStore))
            .entry(&session, br#"{"token":"tok-1"}"#)
            .await;
        assert_eq!(reply.code, CODE_STORAGE);

        assert_eq!(session.user_id().await, "");
    }

    #[test]
    fn failed_reply_serializes_null_msg() {
        let json = serde_json::to_string(&EntryReply::fail(CODE_BAD_TOKEN)).unwrap();
        assert_eq!(json, r#"{"code":401,"msg":null}"#);
    }
}

//! Built-in `hall` service handlers.

use meridian_remote::{HandlerError, RemoteSession, WorkerNode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateUserAddress {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub location: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessage {
    pub to: Vec<String>,
    pub text: String,
}

/// Stores the address on the session and echoes it back.
pub async fn update_user_address(
    session: Arc<RemoteSession>,
    payload: Vec<u8>,
) -> Result<serde_json::Value, HandlerError> {
    let Ok(request) = serde_json::from_slice::<UpdateUserAddress>(&payload) else {
        return Ok(json!({ "code": 400 }));
    };
    info!("🏠 Updating address of {}", session.user_id());
    session.put("address", json!(request.address)).await;
    session.put("location", json!(request.location)).await;
    Ok(json!({ "code": 200, "updateUserData": request }))
}

/// Pushes `text` to every listed user as `onChat`.
pub async fn say(session: Arc<RemoteSession>, payload: Vec<u8>) -> Result<serde_json::Value, HandlerError> {
    let message: ChatMessage = serde_json::from_slice(&payload)?;
    let from = session.user_id().to_string();
    session
        .push(message.to, &json!({ "from": from, "text": message.text }), "onChat")
        .await?;
    Ok(json!({ "code": 200 }))
}

/// Installs every `hall` handler on `node`.
pub fn install_hall(node: &mut WorkerNode) {
    node.on("userHandler.updateUserAddress", update_user_address);
    node.on("chatHandler.say", say);
}

//! NATS-backed bus. Subjects are process ids.

use super::{BusStream, MessageBus};
use crate::error::RemoteError;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{info, warn};

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<Self, RemoteError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| RemoteError::Connect(format!("{url}: {e}")))?;
        info!("📡 Connected to NATS at {}", url);
        Ok(Self { client })
    }

    pub fn from_client(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, dst: &str, payload: Vec<u8>) -> Result<(), RemoteError> {
        self.client
            .publish(dst.to_string(), payload.into())
            .await
            .map_err(|e| RemoteError::Publish {
                dst: dst.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, process_id: &str) -> Result<BusStream, RemoteError> {
        let subscriber = self
            .client
            .subscribe(process_id.to_string())
            .await
            .map_err(|e| RemoteError::Subscribe(format!("{process_id}: {e}")))?;
        Ok(subscriber.map(|message| message.payload.to_vec()).boxed())
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            warn!("Failed to flush NATS client: {}", e);
        }
    }
}

//! Publish/subscribe by process id.
//!
//! Every process subscribes once under its own id; anyone may publish to that
//! id. Payloads are opaque bytes (JSON envelopes in practice).

#[cfg(feature = "nats")]
pub mod nats;

use crate::error::RemoteError;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

pub type BusStream = BoxStream<'static, Vec<u8>>;

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Sends `payload` to the process subscribed as `dst`.
    async fn publish(&self, dst: &str, payload: Vec<u8>) -> Result<(), RemoteError>;

    /// Receives everything published to `process_id`.
    async fn subscribe(&self, process_id: &str) -> Result<BusStream, RemoteError>;

    async fn close(&self);
}

const DEFAULT_MAILBOX: usize = 1024;

/// In-process bus: one bounded mailbox per subscribed process id.
///
/// Publishing to an id nobody subscribed to succeeds and goes nowhere, the
/// same as a broker subject without subscribers.
#[derive(Debug)]
pub struct LocalBus {
    mailboxes: DashMap<String, mpsc::Sender<Vec<u8>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAILBOX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            mailboxes: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn is_subscribed(&self, process_id: &str) -> bool {
        self.mailboxes.contains_key(process_id)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, dst: &str, payload: Vec<u8>) -> Result<(), RemoteError> {
        let sender = match self.mailboxes.get(dst) {
            Some(sender) => sender.clone(),
            None => {
                trace!("No subscriber for {}, dropping {} bytes", dst, payload.len());
                return Ok(());
            }
        };
        match sender.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RemoteError::Publish {
                dst: dst.to_string(),
                reason: "mailbox full".to_string(),
            }),
            Err(TrySendError::Closed(_)) => {
                debug!("Subscriber {} went away", dst);
                self.mailboxes.remove(dst);
                Ok(())
            }
        }
    }

    async fn subscribe(&self, process_id: &str) -> Result<BusStream, RemoteError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.mailboxes.insert(process_id.to_string(), tx).is_some() {
            debug!("Replaced existing subscription for {}", process_id);
        }
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })
        .boxed())
    }

    async fn close(&self) {
        self.mailboxes.clear();
    }
}

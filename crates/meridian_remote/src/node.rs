//! Worker-side dispatcher.
//!
//! A [`WorkerNode`] subscribes under its process id, turns each forwarded
//! envelope into a [`RemoteSession`] plus payload, runs the handler registered
//! under the envelope's `category.method` key, and sends the result back to
//! the originating gateway as a Response. All outbound traffic (responses,
//! session syncs, pushes) leaves through one write queue.

use crate::bus::MessageBus;
use crate::error::{HandlerError, RemoteError};
use crate::session::RemoteSession;
use futures::future::BoxFuture;
use futures::StreamExt;
use meridian_core::{BoundedQueue, Envelope, MessageType, OverflowPolicy};
use meridian_discovery::Registrar;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type HandlerFuture = BoxFuture<'static, Result<serde_json::Value, HandlerError>>;

/// A `category.method` handler. Returning `Value::Null` sends an empty body.
pub type Handler = Arc<dyn Fn(Arc<RemoteSession>, Vec<u8>) -> HandlerFuture + Send + Sync>;

fn default_write_queue() -> usize {
    1024
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Bus subject this worker listens on; also its registered address
    pub process_id: String,
    /// Service name it registers under, e.g. `hall`
    pub server_type: String,
    #[serde(default = "default_write_queue")]
    pub write_queue_capacity: usize,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl WorkerConfig {
    pub fn new(process_id: impl Into<String>, server_type: impl Into<String>) -> Self {
        Self {
            process_id: process_id.into(),
            server_type: server_type.into(),
            write_queue_capacity: default_write_queue(),
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

pub struct WorkerNode {
    config: WorkerConfig,
    bus: Arc<dyn MessageBus>,
    handlers: HashMap<String, Handler>,
    registrar: Option<Registrar>,
}

impl WorkerNode {
    pub fn new(config: WorkerConfig, bus: Arc<dyn MessageBus>) -> Self {
        Self {
            config,
            bus,
            handlers: HashMap::new(),
            registrar: None,
        }
    }

    /// Registers the worker in discovery once it is listening.
    pub fn with_registrar(mut self, registrar: Registrar) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Registers `handler` under `key` (`category.method`). Replaces any
    /// previous handler for the key.
    pub fn on<F, Fut>(&mut self, key: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Arc<RemoteSession>, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |session: Arc<RemoteSession>, payload: Vec<u8>| -> HandlerFuture {
                Box::pin(handler(session, payload))
            });
        self.handlers.insert(key.into(), handler);
        self
    }

    pub fn handler_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.handlers.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Subscribes, starts the read and write loops, then registers.
    pub async fn start(self) -> Result<WorkerHandle, RemoteError> {
        let WorkerNode {
            config,
            bus,
            handlers,
            registrar,
        } = self;

        let inbox = bus.subscribe(&config.process_id).await?;
        let outbox = Arc::new(BoundedQueue::new(
            config.write_queue_capacity,
            config.overflow_policy,
        ));

        let writer = tokio::spawn(write_loop(Arc::clone(&bus), Arc::clone(&outbox)));
        let reader = tokio::spawn(read_loop(
            inbox,
            Arc::new(handlers),
            config.process_id.clone(),
            Arc::clone(&outbox),
        ));

        let mut handle = WorkerHandle {
            process_id: config.process_id.clone(),
            bus,
            outbox,
            reader: Some(reader),
            writer: Some(writer),
            registrar: None,
        };

        if let Some(registrar) = registrar {
            if let Err(e) = registrar.register().await {
                handle.shutdown().await;
                return Err(e.into());
            }
            handle.registrar = Some(registrar);
        }

        info!(
            "🛠️ Worker {} ({}) listening",
            config.process_id, config.server_type
        );
        Ok(handle)
    }
}

/// A running worker.
pub struct WorkerHandle {
    process_id: String,
    bus: Arc<dyn MessageBus>,
    outbox: Arc<BoundedQueue<Envelope>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    registrar: Option<Registrar>,
}

impl WorkerHandle {
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// Deregisters, stops reading, and flushes queued replies.
    pub async fn shutdown(&mut self) {
        if let Some(registrar) = self.registrar.take() {
            registrar.close().await;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.outbox.close();
        if let Some(writer) = self.writer.take() {
            if let Err(e) = writer.await {
                warn!("Write loop for {} ended abnormally: {}", self.process_id, e);
            }
        }
        info!("🛑 Worker {} stopped", self.process_id);
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }
}

async fn read_loop(
    mut inbox: crate::bus::BusStream,
    handlers: Arc<HashMap<String, Handler>>,
    process_id: String,
    outbox: Arc<BoundedQueue<Envelope>>,
) {
    while let Some(bytes) = inbox.next().await {
        let envelope = match Envelope::from_bytes(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("⚠️ Discarding undecodable envelope: {}", e);
                continue;
            }
        };
        if envelope.is_session_sync() {
            debug!("Ignoring session sync addressed to worker {}", process_id);
            continue;
        }
        tokio::spawn(dispatch(
            Arc::clone(&handlers),
            envelope,
            process_id.clone(),
            Arc::clone(&outbox),
        ));
    }
    debug!("Inbox for {} closed", process_id);
}

async fn dispatch(
    handlers: Arc<HashMap<String, Handler>>,
    envelope: Envelope,
    process_id: String,
    outbox: Arc<BoundedQueue<Envelope>>,
) {
    let Some(handler) = handlers.get(&envelope.router) else {
        warn!("❓ No handler for {:?} on {}", envelope.router, process_id);
        return;
    };
    let Some(body) = envelope.body.clone() else {
        warn!("⚠️ Envelope for {} has no body", envelope.router);
        return;
    };

    let session = Arc::new(RemoteSession::new(&envelope, process_id, Arc::clone(&outbox)));
    let value = match handler(session, body.data.clone()).await {
        Ok(value) => value,
        Err(e) => {
            warn!("❌ Handler {} failed: {}", envelope.router, e);
            return;
        }
    };
    if body.kind != MessageType::Request {
        return;
    }

    let data = if value.is_null() {
        Vec::new()
    } else {
        match serde_json::to_vec(&value) {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode result of {}: {}", envelope.router, e);
                return;
            }
        }
    };
    let reply = envelope.reply(body.response(data));
    if outbox.push(reply).await.is_err() {
        warn!("⚠️ Response for {} dropped: worker stopping", envelope.router);
    }
}

async fn write_loop(bus: Arc<dyn MessageBus>, outbox: Arc<BoundedQueue<Envelope>>) {
    while let Some(envelope) = outbox.pop().await {
        let bytes = match envelope.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode envelope for {}: {}", envelope.dst, e);
                continue;
            }
        };
        if let Err(e) = bus.publish(&envelope.dst, bytes).await {
            error!("❌ {}", e);
        }
    }
}

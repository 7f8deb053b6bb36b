//! Lease-backed self-registration.
//!
//! A registration is grant, keep-alive, put. A supervising task watches the
//! keep-alive channel; when the channel dies, the next ttl tick registers
//! again under a fresh lease. While the channel is live the ticks do nothing.

use crate::descriptor::ServiceDescriptor;
use crate::error::{DiscoveryError, StoreError};
use crate::store::{CoordinationStore, KeepAliveResponse, KeepAliveStream, LeaseId};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

fn default_ttl() -> i64 {
    10
}

fn default_op_timeout() -> u64 {
    3
}

/// What to register and how.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrarConfig {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub weight: u32,
    /// Lease ttl in seconds; also the re-registration period
    #[serde(default = "default_ttl")]
    pub ttl: i64,
    /// Upper bound in seconds on each store call
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,
}

impl RegistrarConfig {
    pub fn new(name: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addr: addr.into(),
            version: String::new(),
            weight: 0,
            ttl: default_ttl(),
            op_timeout: default_op_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service name {:?} must be non-empty and contain no '/'",
                self.name
            )));
        }
        if self.addr.is_empty() || self.addr.contains('/') {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service address {:?} must be non-empty and contain no '/'",
                self.addr
            )));
        }
        if self.ttl <= 0 {
            return Err(DiscoveryError::InvalidConfig(
                "ttl must be positive".to_string(),
            ));
        }
        Ok(())
    }

    fn descriptor(&self) -> ServiceDescriptor {
        ServiceDescriptor {
            name: self.name.clone(),
            addr: self.addr.clone(),
            version: self.version.clone(),
            weight: self.weight,
            ttl: self.ttl,
        }
    }
}

#[derive(Default)]
struct Running {
    closed: bool,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Keeps one service instance registered until closed.
pub struct Registrar {
    store: Arc<dyn CoordinationStore>,
    config: RegistrarConfig,
    running: Mutex<Running>,
}

impl Registrar {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: RegistrarConfig,
    ) -> Result<Self, DiscoveryError> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            running: Mutex::new(Running::default()),
        })
    }

    pub fn register_key(&self) -> String {
        self.config.descriptor().build_register_key()
    }

    /// Performs the initial registration and starts supervision.
    ///
    /// Fails if the first grant, keep-alive or put fails. Calling it again
    /// while registered is a no-op.
    pub async fn register(&self) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().await;
        if running.closed {
            return Err(DiscoveryError::Closed);
        }
        if running.task.is_some() {
            return Ok(());
        }

        let descriptor = self.config.descriptor();
        let op_timeout = Duration::from_secs(self.config.op_timeout.max(1));
        let (lease, keep_alive) = register_once(&*self.store, &descriptor, op_timeout).await?;
        info!(
            "📍 Registered {} (lease {}, ttl {}s)",
            descriptor.build_register_key(),
            lease,
            descriptor.ttl
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let supervisor = Supervisor {
            store: Arc::clone(&self.store),
            descriptor,
            lease,
            op_timeout,
        };
        running.stop = Some(stop_tx);
        running.task = Some(tokio::spawn(supervisor.run(keep_alive, stop_rx)));
        Ok(())
    }

    /// Stops supervision, deletes the key and revokes the lease.
    ///
    /// Safe to call before [`Registrar::register`] and more than once.
    pub async fn close(&self) {
        let mut running = self.running.lock().await;
        running.closed = true;
        if let Some(stop) = running.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = running.task.take() {
            if let Err(e) = task.await {
                warn!("Registrar supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Registrar {
    fn drop(&mut self) {
        // Dropping the stop sender makes the supervisor tear down on its own.
        if let Ok(mut running) = self.running.try_lock() {
            running.stop.take();
        }
    }
}

async fn bounded<T, F>(
    op_timeout: Duration,
    op: &'static str,
    call: F,
) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(op_timeout, call)
        .await
        .map_err(|_| StoreError::Timeout(op))?
}

async fn register_once(
    store: &dyn CoordinationStore,
    descriptor: &ServiceDescriptor,
    op_timeout: Duration,
) -> Result<(LeaseId, KeepAliveStream), DiscoveryError> {
    let lease = bounded(op_timeout, "grant", store.grant(descriptor.ttl)).await?;
    match attach(store, descriptor, lease, op_timeout).await {
        Ok(keep_alive) => Ok((lease, keep_alive)),
        Err(e) => {
            // Nothing will refresh this lease; give it back now.
            if let Err(revoke) = bounded(op_timeout, "revoke", store.revoke(lease)).await {
                warn!("Failed to revoke unused lease {}: {}", lease, revoke);
            }
            Err(e)
        }
    }
}

async fn attach(
    store: &dyn CoordinationStore,
    descriptor: &ServiceDescriptor,
    lease: LeaseId,
    op_timeout: Duration,
) -> Result<KeepAliveStream, DiscoveryError> {
    let keep_alive = bounded(op_timeout, "keep_alive", store.keep_alive(lease)).await?;
    let value = descriptor.to_value()?;
    bounded(
        op_timeout,
        "put",
        store.put(&descriptor.build_register_key(), value.as_bytes(), Some(lease)),
    )
    .await?;
    Ok(keep_alive)
}

async fn next_keep_alive(
    keep_alive: &mut Option<KeepAliveStream>,
) -> Option<Result<KeepAliveResponse, StoreError>> {
    match keep_alive {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

struct Supervisor {
    store: Arc<dyn CoordinationStore>,
    descriptor: ServiceDescriptor,
    lease: LeaseId,
    op_timeout: Duration,
}

impl Supervisor {
    async fn run(mut self, keep_alive: KeepAliveStream, mut stop: oneshot::Receiver<()>) {
        let period = Duration::from_secs(self.descriptor.ttl as u64);
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut keep_alive = Some(keep_alive);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    self.teardown().await;
                    return;
                }
                response = next_keep_alive(&mut keep_alive), if keep_alive.is_some() => {
                    match response {
                        Some(Ok(ack)) => debug!("Lease {} refreshed (ttl {}s)", ack.lease, ack.ttl),
                        Some(Err(e)) => {
                            warn!("⚠️ Keep-alive for {} failed: {}", self.descriptor.build_register_key(), e);
                            keep_alive = None;
                        }
                        None => {
                            warn!("⚠️ Keep-alive channel for {} closed", self.descriptor.build_register_key());
                            keep_alive = None;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if keep_alive.is_none() {
                        match register_once(&*self.store, &self.descriptor, self.op_timeout).await {
                            Ok((lease, stream)) => {
                                info!("📍 Re-registered {} (lease {})", self.descriptor.build_register_key(), lease);
                                self.lease = lease;
                                keep_alive = Some(stream);
                            }
                            Err(e) => error!("❌ Re-registration of {} failed: {}", self.descriptor.build_register_key(), e),
                        }
                    }
                }
            }
        }
    }

    async fn teardown(&self) {
        let key = self.descriptor.build_register_key();
        if let Err(e) = bounded(self.op_timeout, "delete", self.store.delete(&key)).await {
            warn!("Failed to delete {} on close: {}", key, e);
        }
        match bounded(self.op_timeout, "revoke", self.store.revoke(self.lease)).await {
            Ok(()) | Err(StoreError::LeaseNotFound(_)) => {}
            Err(e) => warn!("Failed to revoke lease {}: {}", self.lease, e),
        }
        info!("🛑 Deregistered {}", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn config(ttl: i64) -> RegistrarConfig {
        RegistrarConfig {
            ttl,
            weight: 1,
            ..RegistrarConfig::new("hall", "hall-1")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn register_puts_leased_key() {
        let store = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(store.clone(), config(2)).unwrap();
        registrar.register().await.unwrap();

        assert!(store.contains_key("/hall/hall-1"));
        assert!(store.lease_of("/hall/hall-1").is_some());
        registrar.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_keep_alive_suppresses_reregistration() {
        let store = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(store.clone(), config(1)).unwrap();
        registrar.register().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(store.grant_count(), 1);
        registrar.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reregisters_after_lease_loss() {
        let store = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(store.clone(), config(1)).unwrap();
        registrar.register().await.unwrap();

        let first = store.lease_of("/hall/hall-1").unwrap();
        store.expire_lease(first);
        assert!(!store.contains_key("/hall/hall-1"));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let second = store.lease_of("/hall/hall-1").expect("key re-registered");
        assert_ne!(first, second);
        assert_eq!(store.grant_count(), 2);
        registrar.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn close_removes_key_and_lease() {
        let store = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(store.clone(), config(2)).unwrap();
        registrar.register().await.unwrap();
        let lease = store.lease_of("/hall/hall-1").unwrap();

        registrar.close().await;
        assert!(!store.contains_key("/hall/hall-1"));
        assert_eq!(store.revoke(lease).await, Err(StoreError::LeaseNotFound(lease)));

        registrar.close().await;
        assert!(matches!(registrar.register().await, Err(DiscoveryError::Closed)));
    }

    #[tokio::test]
    async fn close_before_register_is_safe() {
        let store = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(store.clone(), config(2)).unwrap();
        registrar.close().await;
        assert_eq!(store.grant_count(), 0);
    }

    #[tokio::test]
    async fn initial_failure_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let registrar = Registrar::new(store.clone(), config(2)).unwrap();
        assert!(matches!(
            registrar.register().await,
            Err(DiscoveryError::Store(StoreError::Unavailable(_)))
        ));
    }

    /// Delegates to a [`MemoryStore`] but refuses every put.
    struct PutRefused(Arc<MemoryStore>);

    #[async_trait::async_trait]
    impl CoordinationStore for PutRefused {
        async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError> {
            self.0.grant(ttl).await
        }
        async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
            self.0.keep_alive(lease).await
        }
        async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
            self.0.revoke(lease).await
        }
        async fn put(&self, _: &str, _: &[u8], _: Option<LeaseId>) -> Result<(), StoreError> {
            Err(StoreError::Backend("put refused".into()))
        }
        async fn get_prefix(&self, prefix: &str) -> Result<Vec<crate::store::KeyValue>, StoreError> {
            self.0.get_prefix(prefix).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
        async fn watch_prefix(&self, prefix: &str) -> Result<crate::store::WatchStream, StoreError> {
            self.0.watch_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn failed_put_revokes_the_granted_lease() {
        let inner = Arc::new(MemoryStore::new());
        let registrar = Registrar::new(Arc::new(PutRefused(inner.clone())), config(2)).unwrap();

        assert!(registrar.register().await.is_err());
        assert!(registrar.register().await.is_err());
        assert_eq!(inner.grant_count(), 2);
        assert_eq!(inner.live_leases(), 0);
    }

    #[test]
    fn rejects_invalid_config() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        assert!(Registrar::new(store.clone(), config(0)).is_err());
        let bad_name = RegistrarConfig::new("a/b", "x");
        assert!(Registrar::new(store, bad_name).is_err());
    }
}

//! Watch-driven resolution of one service name.
//!
//! The resolver keeps the address set for `name` in step with the store: a
//! full resync at build time and periodically after, incremental updates from
//! a prefix watch in between. Each net change is published to an
//! [`AddressSink`].

use crate::descriptor::{service_prefix, AddressEntry, ServiceDescriptor};
use crate::error::{DiscoveryError, StoreError};
use crate::store::{CoordinationStore, WatchEvent, WatchResponse, WatchStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Receives the full address set of a service whenever it changes.
pub trait AddressSink: Send + Sync {
    fn update(&self, name: &str, addresses: &[AddressEntry]) -> Result<(), DiscoveryError>;
}

fn default_op_timeout() -> u64 {
    3
}

fn default_resync_interval() -> u64 {
    60
}

fn default_retry_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Upper bound in seconds on each store call
    #[serde(default = "default_op_timeout")]
    pub op_timeout: u64,
    /// Seconds between full resyncs
    #[serde(default = "default_resync_interval")]
    pub resync_interval: u64,
    /// Delay before re-opening a dead watch
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            op_timeout: default_op_timeout(),
            resync_interval: default_resync_interval(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }
}

/// Current addresses of one service, keyed by address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    entries: BTreeMap<String, AddressEntry>,
}

impl AddressSet {
    /// Adds an entry if its address is absent. Returns whether the set changed.
    pub fn insert(&mut self, entry: AddressEntry) -> bool {
        if self.entries.contains_key(&entry.addr) {
            return false;
        }
        self.entries.insert(entry.addr.clone(), entry);
        true
    }

    pub fn remove(&mut self, addr: &str) -> bool {
        self.entries.remove(addr).is_some()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<AddressEntry> {
        self.entries.values().cloned().collect()
    }

    /// Applies one watch event. Returns whether the set changed.
    pub fn apply(&mut self, event: &WatchEvent) -> Result<bool, DiscoveryError> {
        match event {
            WatchEvent::Put { value, .. } => {
                let descriptor = ServiceDescriptor::parse_value(value)?;
                Ok(self.insert(descriptor.address_entry()))
            }
            WatchEvent::Delete { key } => {
                let descriptor = ServiceDescriptor::parse_key(key)?;
                Ok(self.remove(&descriptor.addr))
            }
        }
    }
}

impl FromIterator<AddressEntry> for AddressSet {
    fn from_iter<I: IntoIterator<Item = AddressEntry>>(iter: I) -> Self {
        let mut set = AddressSet::default();
        for entry in iter {
            set.insert(entry);
        }
        set
    }
}

#[derive(Default)]
struct Running {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Background resolution of one service name.
pub struct Resolver {
    name: String,
    running: Mutex<Running>,
}

impl Resolver {
    /// Resyncs once and starts watching.
    ///
    /// Fails if the store is unreachable, the sink rejects the first set, or
    /// nothing is registered under `name`.
    pub async fn build(
        store: Arc<dyn CoordinationStore>,
        name: impl Into<String>,
        sink: Arc<dyn AddressSink>,
        config: ResolverConfig,
    ) -> Result<Self, DiscoveryError> {
        let name = name.into();
        if name.is_empty() || name.contains('/') {
            return Err(DiscoveryError::InvalidConfig(format!(
                "service name {:?} must be non-empty and contain no '/'",
                name
            )));
        }

        let mut watcher = Watcher {
            prefix: service_prefix(&name),
            name: name.clone(),
            store,
            sink,
            set: AddressSet::default(),
            op_timeout: Duration::from_secs(config.op_timeout.max(1)),
        };

        // Watch before syncing; replayed events are idempotent.
        let watch = watcher.open_watch().await?;
        watcher.resync().await?;
        info!(
            "🔭 Resolving {} ({} instance(s))",
            name,
            watcher.set.len()
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(watcher.run(watch, stop_rx, config));
        Ok(Self {
            name,
            running: Mutex::new(Running {
                stop: Some(stop_tx),
                task: Some(task),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops the watch. Idempotent.
    pub async fn close(&self) {
        let mut running = self.running.lock().await;
        if let Some(stop) = running.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = running.task.take() {
            if let Err(e) = task.await {
                warn!("Resolver for {} ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.try_lock() {
            running.stop.take();
        }
    }
}

async fn next_batch(
    watch: &mut Option<WatchStream>,
) -> Option<Result<WatchResponse, StoreError>> {
    match watch {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

struct Watcher {
    name: String,
    prefix: String,
    store: Arc<dyn CoordinationStore>,
    sink: Arc<dyn AddressSink>,
    set: AddressSet,
    op_timeout: Duration,
}

impl Watcher {
    async fn open_watch(&self) -> Result<WatchStream, DiscoveryError> {
        let stream = tokio::time::timeout(self.op_timeout, self.store.watch_prefix(&self.prefix))
            .await
            .map_err(|_| StoreError::Timeout("watch"))??;
        Ok(stream)
    }

    /// Replaces the set with the store's view and publishes it.
    ///
    /// An empty view leaves the current set untouched.
    async fn resync(&mut self) -> Result<(), DiscoveryError> {
        let kvs = tokio::time::timeout(self.op_timeout, self.store.get_prefix(&self.prefix))
            .await
            .map_err(|_| StoreError::Timeout("get"))??;

        let mut fresh = AddressSet::default();
        for kv in kvs {
            match ServiceDescriptor::parse_value(&kv.value) {
                Ok(descriptor) => {
                    fresh.insert(descriptor.address_entry());
                }
                Err(e) => warn!("Skipping unreadable registry entry {}: {}", kv.key, e),
            }
        }
        if fresh.is_empty() {
            return Err(DiscoveryError::NoInstances(self.name.clone()));
        }

        self.set = fresh;
        self.publish()
    }

    fn apply(&mut self, response: WatchResponse) {
        let mut changed = false;
        for event in &response.events {
            match self.set.apply(event) {
                Ok(true) => {
                    debug!("{} changed by {:?}", self.name, event.key());
                    changed = true;
                }
                Ok(false) => {}
                Err(e) => warn!("Ignoring watch event for {}: {}", event.key(), e),
            }
        }
        if changed {
            if let Err(e) = self.publish() {
                error!("❌ {}", e);
            }
        }
    }

    fn publish(&self) -> Result<(), DiscoveryError> {
        self.sink.update(&self.name, &self.set.entries())
    }

    async fn run(
        mut self,
        watch: WatchStream,
        mut stop: oneshot::Receiver<()>,
        config: ResolverConfig,
    ) {
        let resync_period = Duration::from_secs(config.resync_interval.max(1));
        let mut resync = tokio::time::interval_at(Instant::now() + resync_period, resync_period);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let retry_period = Duration::from_millis(config.retry_interval_ms.max(1));
        let mut retry = tokio::time::interval_at(Instant::now() + retry_period, retry_period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut watch = Some(watch);

        loop {
            tokio::select! {
                _ = &mut stop => {
                    info!("🔭 Stopped resolving {}", self.name);
                    return;
                }
                batch = next_batch(&mut watch), if watch.is_some() => {
                    match batch {
                        Some(Ok(response)) => self.apply(response),
                        Some(Err(e)) => {
                            // Events were missed; only a full read can recover.
                            warn!("⚠️ Watch on {} failed: {}", self.prefix, e);
                            if let Err(e) = self.resync().await {
                                error!("❌ Resync of {} failed: {}", self.name, e);
                            }
                        }
                        None => {
                            warn!("⚠️ Watch on {} closed", self.prefix);
                            watch = None;
                        }
                    }
                }
                _ = retry.tick(), if watch.is_none() => {
                    match self.open_watch().await {
                        Ok(stream) => {
                            info!("🔭 Re-opened watch on {}", self.prefix);
                            watch = Some(stream);
                            if let Err(e) = self.resync().await {
                                error!("❌ Resync of {} failed: {}", self.name, e);
                            }
                        }
                        Err(e) => warn!("Failed to re-open watch on {}: {}", self.prefix, e),
                    }
                }
                _ = resync.tick() => {
                    if let Err(e) = self.resync().await {
                        error!("❌ Resync of {} failed: {}", self.name, e);
                    }
                }
            }
        }
    }
}

//! etcd-backed coordination store.
//!
//! Leases, prefix reads and prefix watches map one-to-one onto etcd's own
//! primitives. Keep-alive refreshes are sent at a third of the lease ttl.

use super::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, WatchEvent,
    WatchResponse, WatchStream,
};
use crate::error::StoreError;
use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions,
    WatchOptions, Watcher,
};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to the cluster behind `endpoints` (e.g. `127.0.0.1:2379`).
    pub async fn connect(endpoints: &[String], dial_timeout: Duration) -> Result<Self, StoreError> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no etcd endpoints configured".into()));
        }
        let options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(store_error)?;
        info!("🔗 Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }
}

fn store_error(e: etcd_client::Error) -> StoreError {
    match e {
        etcd_client::Error::TransportError(_) | etcd_client::Error::IoError(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Backend(other.to_string()),
    }
}

fn watch_event(kind: EventType, key: &[u8], value: &[u8]) -> WatchEvent {
    let key = String::from_utf8_lossy(key).into_owned();
    match kind {
        EventType::Put => WatchEvent::Put {
            key,
            value: value.to_vec(),
        },
        EventType::Delete => WatchEvent::Delete { key },
    }
}

/// Refresh period for a lease with `ttl` seconds left.
fn refresh_period(ttl: i64) -> Duration {
    Duration::from_secs((ttl / 3).max(1) as u64)
}

struct Refresh {
    lease: LeaseId,
    keeper: LeaseKeeper,
    responses: LeaseKeepAliveStream,
    period: Option<Duration>,
}

struct Watch {
    // Dropping the watcher cancels the watch.
    _watcher: Watcher,
    responses: etcd_client::WatchStream,
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        let mut client = self.client.clone();
        let response = client.lease_grant(ttl, None).await.map_err(store_error)?;
        debug!("Granted lease {} (ttl {}s)", response.id(), response.ttl());
        Ok(response.id())
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        let mut client = self.client.clone();
        let (keeper, responses) = client.lease_keep_alive(lease).await.map_err(store_error)?;
        let state = Refresh {
            lease,
            keeper,
            responses,
            period: None,
        };

        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut refresh = state?;
            if let Some(period) = refresh.period {
                tokio::time::sleep(period).await;
            }
            if let Err(e) = refresh.keeper.keep_alive().await {
                return Some((Err(store_error(e)), None));
            }
            match refresh.responses.message().await {
                Ok(Some(response)) if response.ttl() > 0 => {
                    refresh.period = Some(refresh_period(response.ttl()));
                    let ack = KeepAliveResponse {
                        lease: response.id(),
                        ttl: response.ttl(),
                    };
                    Some((Ok(ack), Some(refresh)))
                }
                // etcd answers a refresh of an unknown lease with ttl 0
                Ok(Some(_)) => Some((Err(StoreError::LeaseNotFound(refresh.lease)), None)),
                Ok(None) => None,
                Err(e) => Some((Err(store_error(e)), None)),
            }
        });
        Ok(stream.boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.lease_revoke(lease).await.map_err(store_error)?;
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await.map_err(store_error)?;
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        Ok(response
            .kvs()
            .iter()
            .map(|kv| KeyValue {
                key: String::from_utf8_lossy(kv.key()).into_owned(),
                value: kv.value().to_vec(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(key, None).await.map_err(store_error)?;
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let (watcher, responses) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(store_error)?;
        let state = Watch {
            _watcher: watcher,
            responses,
        };

        let stream = futures::stream::unfold(Some(state), |state| async move {
            let mut watch = state?;
            match watch.responses.message().await {
                Ok(Some(response)) if response.canceled() => None,
                Ok(Some(response)) => {
                    let events = response
                        .events()
                        .iter()
                        .filter_map(|event| {
                            let kv = event.kv()?;
                            Some(watch_event(event.event_type(), kv.key(), kv.value()))
                        })
                        .collect();
                    Some((Ok(WatchResponse { events }), Some(watch)))
                }
                Ok(None) => None,
                Err(e) => Some((Err(store_error(e)), None)),
            }
        });
        Ok(stream.boxed())
    }
}

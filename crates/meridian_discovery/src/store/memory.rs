//! In-process coordination store.
//!
//! Backs standalone mode and the test suites. Leases do not expire on a
//! clock; [`MemoryStore::expire_lease`] simulates an expiry instead.

use super::{
    CoordinationStore, KeepAliveResponse, KeepAliveStream, KeyValue, LeaseId, WatchEvent,
    WatchResponse, WatchStream,
};
use crate::error::StoreError;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

const WATCH_CAPACITY: usize = 1024;
const MIN_REFRESH: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    lease: Option<LeaseId>,
}

#[derive(Debug)]
struct Lease {
    ttl: i64,
    keys: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    kv: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, Lease>,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    events: broadcast::Sender<WatchEvent>,
    next_lease: AtomicI64,
    grants: AtomicU64,
    unavailable: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            events,
            next_lease: AtomicI64::new(1),
            grants: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of leases granted so far.
    pub fn grant_count(&self) -> u64 {
        self.grants.load(Ordering::SeqCst)
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of leases neither revoked nor expired.
    pub fn live_leases(&self) -> usize {
        lock(&self.state).leases.len()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.state).kv.contains_key(key)
    }

    /// Lease currently attached to `key`, if any.
    pub fn lease_of(&self, key: &str) -> Option<LeaseId> {
        lock(&self.state).kv.get(key).and_then(|entry| entry.lease)
    }

    /// Drops a lease as if its ttl had run out: attached keys are deleted and
    /// its keep-alive stream ends.
    pub fn expire_lease(&self, lease: LeaseId) {
        debug!("⌛ Expiring lease {}", lease);
        self.remove_lease(lease);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store offline".into()))
        } else {
            Ok(())
        }
    }

    fn remove_lease(&self, lease: LeaseId) -> bool {
        let deleted = {
            let mut state = lock(&self.state);
            let Some(removed) = state.leases.remove(&lease) else {
                return false;
            };
            let mut deleted = Vec::new();
            for key in removed.keys {
                if let Some(entry) = state.kv.get(&key) {
                    if entry.lease == Some(lease) {
                        state.kv.remove(&key);
                        deleted.push(key);
                    }
                }
            }
            deleted
        };
        for key in deleted {
            self.emit(WatchEvent::Delete { key });
        }
        true
    }

    fn emit(&self, event: WatchEvent) {
        // No receivers just means nobody is watching.
        let _ = self.events.send(event);
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError> {
        self.check()?;
        let lease = self.next_lease.fetch_add(1, Ordering::SeqCst);
        lock(&self.state).leases.insert(
            lease,
            Lease {
                ttl,
                keys: HashSet::new(),
            },
        );
        self.grants.fetch_add(1, Ordering::SeqCst);
        trace!("Granted lease {} (ttl {}s)", lease, ttl);
        Ok(lease)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError> {
        self.check()?;
        let ttl = lock(&self.state)
            .leases
            .get(&lease)
            .map(|l| l.ttl)
            .ok_or(StoreError::LeaseNotFound(lease))?;

        let refresh = Duration::from_millis((ttl.max(1) as u64) * 1000 / 3).max(MIN_REFRESH);
        let (tx, rx) = mpsc::channel::<Result<KeepAliveResponse, StoreError>>(16);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh);
            loop {
                ticker.tick().await;
                let alive = lock(&state).leases.contains_key(&lease);
                if !alive {
                    trace!("Lease {} gone, ending keep-alive", lease);
                    break;
                }
                if tx.send(Ok(KeepAliveResponse { lease, ttl })).await.is_err() {
                    break;
                }
            }
        });

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError> {
        self.check()?;
        if self.remove_lease(lease) {
            Ok(())
        } else {
            Err(StoreError::LeaseNotFound(lease))
        }
    }

    async fn put(
        &self,
        key: &str,
        value: &[u8],
        lease: Option<LeaseId>,
    ) -> Result<(), StoreError> {
        self.check()?;
        {
            let mut state = lock(&self.state);
            if let Some(id) = lease {
                state
                    .leases
                    .get_mut(&id)
                    .ok_or(StoreError::LeaseNotFound(id))?
                    .keys
                    .insert(key.to_string());
            }
            let previous = state.kv.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    lease,
                },
            );
            if let Some(old) = previous.and_then(|entry| entry.lease) {
                if Some(old) != lease {
                    if let Some(old_lease) = state.leases.get_mut(&old) {
                        old_lease.keys.remove(key);
                    }
                }
            }
        }
        self.emit(WatchEvent::Put {
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError> {
        self.check()?;
        let state = lock(&self.state);
        Ok(state
            .kv
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue {
                key: key.clone(),
                value: entry.value.clone(),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        let removed = {
            let mut state = lock(&self.state);
            let removed = state.kv.remove(key);
            if let Some(lease) = removed.as_ref().and_then(|entry| entry.lease) {
                if let Some(lease) = state.leases.get_mut(&lease) {
                    lease.keys.remove(key);
                }
            }
            removed.is_some()
        };
        if removed {
            self.emit(WatchEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.check()?;
        let rx = self.events.subscribe();
        let prefix = prefix.to_string();

        Ok(futures::stream::unfold((rx, prefix), |(mut rx, prefix)| async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.key().starts_with(&prefix) => {
                        let response = WatchResponse {
                            events: vec![event],
                        };
                        return Some((Ok(response), (rx, prefix)));
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        return Some((Err(StoreError::WatchLagged(missed)), (rx, prefix)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn prefix_get_only_returns_matching_keys() {
        let store = MemoryStore::new();
        store.put("/hall/a", b"1", None).await.unwrap();
        store.put("/hall/b", b"2", None).await.unwrap();
        store.put("/hallway/c", b"3", None).await.unwrap();

        let keys: Vec<String> = store
            .get_prefix("/hall/")
            .await
            .unwrap()
            .into_iter()
            .map(|kv| kv.key)
            .collect();
        assert_eq!(keys, vec!["/hall/a", "/hall/b"]);
    }

    #[tokio::test]
    async fn revoke_deletes_attached_keys_and_notifies() {
        let store = MemoryStore::new();
        let mut watch = store.watch_prefix("/hall/").await.unwrap();

        let lease = store.grant(5).await.unwrap();
        store.put("/hall/a", b"1", Some(lease)).await.unwrap();
        store.revoke(lease).await.unwrap();

        assert!(!store.contains_key("/hall/a"));
        let put = watch.next().await.unwrap().unwrap();
        assert!(matches!(put.events[0], WatchEvent::Put { .. }));
        let delete = watch.next().await.unwrap().unwrap();
        assert_eq!(
            delete.events,
            vec![WatchEvent::Delete {
                key: "/hall/a".into()
            }]
        );
        assert_eq!(store.revoke(lease).await, Err(StoreError::LeaseNotFound(lease)));
    }

    #[tokio::test]
    async fn put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        assert_eq!(
            store.put("/hall/a", b"1", Some(42)).await,
            Err(StoreError::LeaseNotFound(42))
        );
        assert!(!store.contains_key("/hall/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_stream_ends_when_lease_expires() {
        let store = MemoryStore::new();
        let lease = store.grant(3).await.unwrap();
        let mut stream = store.keep_alive(lease).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.lease, lease);

        store.expire_lease(lease);
        let mut ended = false;
        for _ in 0..20 {
            if stream.next().await.is_none() {
                ended = true;
                break;
            }
        }
        assert!(ended);
    }

    #[tokio::test]
    async fn unavailable_store_rejects_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.grant(5).await, Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.grant(5).await.is_ok());
    }
}

//! The coordination store boundary.
//!
//! Any strongly consistent key-value store with leases and prefix watches can
//! back discovery. Keys attached to a lease disappear when the lease is
//! revoked or expires, which is what makes crashed instances drop out.

#[cfg(feature = "etcd")]
pub mod etcd;
pub mod memory;

use crate::error::StoreError;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// One acknowledgement of a lease refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveResponse {
    pub lease: LeaseId,
    /// Remaining ttl in seconds
    pub ttl: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key } => key,
        }
    }
}

/// A batch of events delivered together by the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchResponse {
    pub events: Vec<WatchEvent>,
}

/// Ends when the lease is gone or the store drops the channel.
pub type KeepAliveStream = BoxStream<'static, Result<KeepAliveResponse, StoreError>>;

/// Ends when the store cancels the watch.
pub type WatchStream = BoxStream<'static, Result<WatchResponse, StoreError>>;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Creates a lease that expires after `ttl` seconds without refresh.
    async fn grant(&self, ttl: i64) -> Result<LeaseId, StoreError>;

    /// Starts refreshing a lease; each refresh is reported on the stream.
    async fn keep_alive(&self, lease: LeaseId) -> Result<KeepAliveStream, StoreError>;

    /// Revokes a lease and deletes every key attached to it.
    async fn revoke(&self, lease: LeaseId) -> Result<(), StoreError>;

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>)
        -> Result<(), StoreError>;

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<KeyValue>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Streams every change under `prefix` from now on.
    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}

//! Error types for discovery operations.

use crate::store::LeaseId;

/// Failures reported by a coordination store backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// A bounded store call ran out of time
    #[error("coordination store call timed out: {0}")]
    Timeout(&'static str),

    /// The lease was revoked or has expired
    #[error("lease {0} not found")]
    LeaseNotFound(LeaseId),

    /// The watcher fell behind and missed events
    #[error("watch lagged by {0} events")]
    WatchLagged(u64),

    /// Any other backend failure
    #[error("coordination store error: {0}")]
    Backend(String),
}

/// Failures of the registrar and resolver.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A registry key with neither two nor three path tokens
    #[error("invalid registry key: {0:?}")]
    InvalidKey(String),

    /// A registry value that is not a descriptor
    #[error("invalid registry value: {0}")]
    InvalidValue(#[from] serde_json::Error),

    /// A resync found nothing registered under the name
    #[error("no instances registered for {0:?}")]
    NoInstances(String),

    #[error("invalid discovery configuration: {0}")]
    InvalidConfig(String),

    /// The address sink refused an update
    #[error("failed to publish addresses: {0}")]
    Publish(String),

    /// The component was already closed
    #[error("already closed")]
    Closed,
}

//! Error types for the gateway.

use meridian_core::{ProtocolError, RouteError};
use meridian_discovery::DiscoveryError;
use meridian_remote::{HandlerError, RemoteError};

/// Failures that stop the gateway or one of its connections.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Binding, accepting or upgrading failed
    #[error("Network error: {0}")]
    Network(String),

    /// Invalid configuration or a broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

/// Why a client message was not handled. The client gets no reply.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error(transparent)]
    InvalidRoute(#[from] RouteError),

    #[error("no instance available for server type {0:?}")]
    NoInstance(String),

    #[error("no local handler for {0:?}")]
    UnknownHandler(String),

    #[error("local handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("forwarding failed: {0}")]
    Forward(#[from] RemoteError),
}

/// Failures of the entry flow's collaborators.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("token rejected")]
    InvalidToken,

    #[error("user {0} already exists")]
    DuplicateUser(String),

    #[error("user store failed: {0}")]
    Storage(String),
}

use meridian_discovery::DiscoveryError;

/// Failures of the inter-process layer.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("failed to connect to message bus: {0}")]
    Connect(String),

    #[error("failed to publish to {dst}: {reason}")]
    Publish { dst: String, reason: String },

    #[error("failed to subscribe as {0}")]
    Subscribe(String),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("worker already stopped")]
    Closed,
}

/// Returned by worker handlers. A failed request gets no response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("handler failed: {0}")]
    Failed(String),
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::BadRequest(e.to_string())
    }
}

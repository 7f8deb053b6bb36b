//! Client connections and their sessions.
//!
//! Each WebSocket client is a [`Connection`] with its own outbound queue and a
//! gateway-side [`Session`]. The [`ConnectionManager`] owns the live set.

pub mod client;
pub mod manager;
pub mod session;

pub use client::{next_connection_id, Connection, ConnectionState};
pub use manager::{ClientFrame, ConnectionManager};
pub use session::Session;

/// Connection ids have the form `{uuid}-{serverId}-{counter}`.
pub type ConnectionId = String;

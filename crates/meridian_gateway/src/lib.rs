//! # Meridian Gateway - Client-Facing Connector
//!
//! The gateway terminates WebSocket clients and routes their messages. It
//! handles no application logic of its own beyond the entry handler; every
//! other route is forwarded to a worker of the route's server type.
//!
//! ## Architecture Overview
//!
//! * **Connection Manager** - connection lifecycle, the shared client intake,
//!   the remote intake from the bus and push fan-out
//! * **Router** - runs local handlers or forwards to one instance picked by a
//!   [`messaging::LoadBalancer`]
//! * **Entry handler** - token check, user find-or-create, session binding
//! * **Gateway server** - accept loop and per-connection read/write pumps
//!
//! ### Message Flow
//!
//! 1. A client frame is decoded into a packet (handshake, heartbeat, data, ...)
//! 2. Data packets carry a message routed by `serverType.category.method`
//! 3. Local server types are answered directly with a Response
//! 4. Remote server types are wrapped in an envelope and published to the
//!    chosen worker, whose reply returns through the bus
//!
//! ## Error Handling
//!
//! [`ServerError`] covers failures of the server itself. [`RoutingError`]
//! describes why one client message was dropped; those are logged and the
//! client receives nothing.

pub use config::GatewayConfig;
pub use connection::{Connection, ConnectionManager, Session};
pub use entry::{EntryHandler, MemoryUserStore, StaticTokenVerifier, TokenVerifier, UserStore};
pub use error::{EntryError, RoutingError, ServerError};
pub use messaging::{BalancerKind, RouteOutcome, Router};
pub use server::GatewayServer;

pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
pub mod messaging;
pub mod server;

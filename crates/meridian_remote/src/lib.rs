//! # Meridian Remote
//!
//! Everything that crosses a process boundary after the gateway: the
//! publish/subscribe bus addressed by process id, the worker-side session
//! proxy, and the [`WorkerNode`] that dispatches forwarded requests to
//! `category.method` handlers.
//!
//! Delivery is best effort. Publish failures are logged and never retried.

pub mod bus;
pub mod error;
pub mod node;
pub mod session;

pub use bus::{BusStream, LocalBus, MessageBus};
#[cfg(feature = "nats")]
pub use bus::nats::NatsBus;
pub use error::{HandlerError, RemoteError};
pub use node::{Handler, HandlerFuture, WorkerConfig, WorkerHandle, WorkerNode};
pub use session::RemoteSession;

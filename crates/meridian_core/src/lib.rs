//! # Meridian Core - Shared Wire Types
//!
//! Everything a gateway and a worker must agree on lives here:
//!
//! * **Wire protocol** - packet framing and the message framing carried inside
//!   `Data` packets ([`protocol`])
//! * **Routes** - `serverType.category.method` capability names ([`route`])
//! * **Envelopes** - the JSON wrapper exchanged between processes ([`envelope`])
//! * **Bounded queues** - fire-and-forget outbound queues with an explicit
//!   overflow policy ([`queue`])
//!
//! ## Message Flow
//!
//! 1. A client frame is decoded into a [`Packet`]
//! 2. `Data` packets carry a [`Message`] whose route names the target service
//! 3. Messages for remote services travel inside an [`Envelope`]
//! 4. Replies come back as envelopes and are re-encoded as `Data` packets

pub mod encoding;
pub mod envelope;
pub mod error;
pub mod protocol;
pub mod queue;
pub mod route;

pub use envelope::{Envelope, EnvelopeKind, SessionData};
pub use error::{ProtocolError, RouteError};
pub use protocol::handshake::{HandshakeResponse, HandshakeSys};
pub use protocol::message::{Message, MessageType};
pub use protocol::packet::{Packet, PacketType};
pub use queue::{BoundedQueue, OverflowPolicy, QueueClosed};
pub use route::Route;

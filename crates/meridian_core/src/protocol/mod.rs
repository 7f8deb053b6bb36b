//! Client wire protocol.
//!
//! Two framing layers ride on every binary transport frame:
//!
//! * [`packet`] - `[type:u8][len:u24 BE][body]`, one packet per frame
//! * [`message`] - the body of a `Data` packet: flag byte, optional varint id,
//!   optional length-prefixed route, then the payload
//!
//! Frame boundaries come from the transport, so decoding is total over one
//! frame and a failure only drops that frame.

pub mod handshake;
pub mod message;
pub mod packet;

pub use handshake::{HandshakeResponse, HandshakeSys};
pub use message::{Message, MessageType};
pub use packet::{decode, encode, Packet, PacketType};

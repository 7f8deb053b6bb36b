//! Error types for the wire protocol and route parsing.
//!
//! Decode failures are terminal only for the frame being decoded; callers log
//! them and move on to the next frame.

/// Failures while encoding or decoding packets and messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Frame shorter than the fixed packet header
    #[error("packet too short: {0} bytes")]
    ShortPacket(usize),

    /// Packet type byte outside the known range
    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    /// Header length does not match the bytes the transport delivered
    #[error("packet length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Body too large for the 24-bit length field
    #[error("packet body too large: {0} bytes")]
    BodyTooLarge(usize),

    /// Message type bits outside the known range
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Message ended before a required field was read
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),

    /// Message id varint longer than 64 bits
    #[error("message id overflows u64")]
    IdOverflow,

    /// Compressed route codes need a negotiated dictionary, which is never sent
    #[error("compressed routes are not supported")]
    CompressedRoute,

    /// Route longer than the one-byte length prefix allows
    #[error("route too long: {0} bytes")]
    RouteTooLong(usize),

    /// Route bytes are not UTF-8
    #[error("route is not valid UTF-8")]
    RouteEncoding,

    /// A message body was requested from a non-data packet
    #[error("packet is not a data packet")]
    NotData,
}

/// A route that does not split into `serverType.category.method`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("route format unsupported: {0:?}")]
pub struct RouteError(pub String);

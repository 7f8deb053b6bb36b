//! Packet framing.

use super::message::Message;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

/// Size of the fixed packet header: one type byte plus a 24-bit length.
pub const HEADER_LEN: usize = 4;

/// Largest body the 24-bit length field can describe.
pub const MAX_BODY_LEN: usize = (1 << 24) - 1;

/// Top-level packet kinds on the client transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Handshake = 1,
    HandshakeAck = 2,
    Heartbeat = 3,
    Data = 4,
    Kick = 5,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Handshake),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Heartbeat),
            4 => Ok(Self::Data),
            5 => Ok(Self::Kick),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// One decoded transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, body: Vec<u8>) -> Self {
        Self { kind, body }
    }

    /// Decodes the body of a `Data` packet as a [`Message`].
    pub fn message(&self) -> Result<Message, ProtocolError> {
        if self.kind != PacketType::Data {
            return Err(ProtocolError::NotData);
        }
        Message::decode(&self.body)
    }

    /// Re-encodes this packet into a transport frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self.kind, &self.body)
    }
}

/// Encodes a packet frame: `[type][len:u24 BE][body]`.
pub fn encode(kind: PacketType, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }
    let len = body.len();
    let mut frame = Vec::with_capacity(HEADER_LEN + len);
    frame.push(kind as u8);
    frame.push(((len >> 16) & 0xff) as u8);
    frame.push(((len >> 8) & 0xff) as u8);
    frame.push((len & 0xff) as u8);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Decodes exactly one transport frame into a [`Packet`].
pub fn decode(frame: &[u8]) -> Result<Packet, ProtocolError> {
    if frame.len() < HEADER_LEN {
        return Err(ProtocolError::ShortPacket(frame.len()));
    }
    let kind = PacketType::try_from(frame[0])?;
    let declared = ((frame[1] as usize) << 16) | ((frame[2] as usize) << 8) | frame[3] as usize;
    let actual = frame.len() - HEADER_LEN;
    if declared != actual {
        return Err(ProtocolError::LengthMismatch { declared, actual });
    }
    Ok(Packet {
        kind,
        body: frame[HEADER_LEN..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_big_endian_length() {
        let body = vec![7u8; 0x01_02_03];
        let frame = encode(PacketType::Data, &body).unwrap();
        assert_eq!(&frame[..4], &[4, 0x01, 0x02, 0x03]);
        assert_eq!(frame.len(), 4 + 0x01_02_03);
    }

    #[test]
    fn decodes_empty_heartbeat() {
        let packet = decode(&[3, 0, 0, 0]).unwrap();
        assert_eq!(packet.kind, PacketType::Heartbeat);
        assert!(packet.body.is_empty());
    }

    #[test]
    fn rejects_short_frames_and_unknown_types() {
        assert_eq!(decode(&[1, 0]), Err(ProtocolError::ShortPacket(2)));
        assert_eq!(decode(&[9, 0, 0, 0]), Err(ProtocolError::UnknownPacketType(9)));
        assert_eq!(decode(&[0, 0, 0, 0]), Err(ProtocolError::UnknownPacketType(0)));
    }

    #[test]
    fn rejects_length_mismatch() {
        let err = decode(&[4, 0, 0, 5, 1, 2]).unwrap_err();
        assert_eq!(err, ProtocolError::LengthMismatch { declared: 5, actual: 2 });
    }

    #[test]
    fn message_requires_data_packet() {
        let packet = Packet::new(PacketType::Kick, Vec::new());
        assert_eq!(packet.message(), Err(ProtocolError::NotData));
    }

    #[test]
    fn oversized_body_is_refused() {
        let body = vec![0u8; MAX_BODY_LEN + 1];
        assert_eq!(
            encode(PacketType::Data, &body),
            Err(ProtocolError::BodyTooLarge(MAX_BODY_LEN + 1))
        );
    }
}

//! Message framing inside `Data` packets.
//!
//! Layout: `[flag][id][route][data]` where
//!
//! * `flag` = `type << 1 | route_compressed`
//! * `id` is a little-endian base-128 varint, present for requests and responses
//! * `route` is a one-byte length followed by UTF-8, present for requests,
//!   notifies and pushes
//! * `data` is everything that remains

use crate::encoding::base64_bytes;
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};

const ROUTE_COMPRESSED: u8 = 0x01;
const TYPE_MASK: u8 = 0x07;

/// Message kinds carried in `Data` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageType {
    #[default]
    Request = 0,
    Notify = 1,
    Response = 2,
    Push = 3,
}

impl MessageType {
    /// Requests and responses are correlated by id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }

    /// Everything but a response names its route on the wire.
    pub fn has_route(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Notify),
            2 => Ok(Self::Response),
            3 => Ok(Self::Push),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// An application message addressed by route.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub route: String,
    #[serde(with = "base64_bytes", default)]
    pub data: Vec<u8>,
}

impl Message {
    pub fn request(id: u64, route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Request,
            id,
            route: route.into(),
            data,
        }
    }

    pub fn push(route: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Push,
            id: 0,
            route: route.into(),
            data,
        }
    }

    /// Builds the response for this message, keeping its id and route.
    pub fn response(&self, data: Vec<u8>) -> Self {
        Self {
            kind: MessageType::Response,
            id: self.id,
            route: self.route.clone(),
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(1 + 10 + 1 + self.route.len() + self.data.len());
        buf.push((self.kind as u8) << 1);
        if self.kind.has_id() {
            write_varint(&mut buf, self.id);
        }
        if self.kind.has_route() {
            let route = self.route.as_bytes();
            if route.len() > u8::MAX as usize {
                return Err(ProtocolError::RouteTooLong(route.len()));
            }
            buf.push(route.len() as u8);
            buf.extend_from_slice(route);
        }
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let flag = *bytes.first().ok_or(ProtocolError::Truncated("flag"))?;
        if flag & ROUTE_COMPRESSED != 0 {
            return Err(ProtocolError::CompressedRoute);
        }
        let kind = MessageType::try_from((flag >> 1) & TYPE_MASK)?;
        let mut offset = 1;

        let id = if kind.has_id() {
            read_varint(bytes, &mut offset)?
        } else {
            0
        };

        let route = if kind.has_route() {
            let len = *bytes.get(offset).ok_or(ProtocolError::Truncated("route length"))? as usize;
            offset += 1;
            let raw = bytes
                .get(offset..offset + len)
                .ok_or(ProtocolError::Truncated("route"))?;
            offset += len;
            std::str::from_utf8(raw)
                .map_err(|_| ProtocolError::RouteEncoding)?
                .to_string()
        } else {
            String::new()
        };

        Ok(Self {
            kind,
            id,
            route,
            data: bytes[offset..].to_vec(),
        })
    }
}

fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(bytes: &[u8], offset: &mut usize) -> Result<u64, ProtocolError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*offset).ok_or(ProtocolError::Truncated("id"))?;
        *offset += 1;
        if shift > 63 {
            return Err(ProtocolError::IdOverflow);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout_matches_wire_format() {
        let msg = Message::request(300, "hall.a.b", b"{}".to_vec());
        let bytes = msg.encode().unwrap();
        // flag, id 300 = 0xAC 0x02, route length, route, data
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..3], &[0xAC, 0x02]);
        assert_eq!(bytes[3], 8);
        assert_eq!(&bytes[4..12], b"hall.a.b");
        assert_eq!(&bytes[12..], b"{}");
        assert_eq!(Message::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn response_omits_route_on_the_wire() {
        let req = Message::request(7, "connector.entryHandler.entry", Vec::new());
        let res = req.response(b"ok".to_vec());
        let decoded = Message::decode(&res.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageType::Response);
        assert_eq!(decoded.id, 7);
        assert!(decoded.route.is_empty());
        assert_eq!(decoded.data, b"ok");
    }

    #[test]
    fn push_and_notify_carry_no_id() {
        let push = Message::push("room.push", b"x".to_vec());
        let bytes = push.encode().unwrap();
        assert_eq!(bytes[0], 3 << 1);
        assert_eq!(bytes[1], 9);
        let decoded = Message::decode(&bytes).unwrap();
        assert_eq!(decoded.id, 0);
        assert_eq!(decoded.route, "room.push");
    }

    #[test]
    fn decode_failures_are_explicit() {
        assert_eq!(Message::decode(&[]), Err(ProtocolError::Truncated("flag")));
        assert_eq!(Message::decode(&[0x01]), Err(ProtocolError::CompressedRoute));
        assert_eq!(Message::decode(&[4 << 1]), Err(ProtocolError::UnknownMessageType(4)));
        assert_eq!(Message::decode(&[0x00, 0x80]), Err(ProtocolError::Truncated("id")));
        assert_eq!(Message::decode(&[0x00, 0x01, 5, b'a']), Err(ProtocolError::Truncated("route")));
    }

    #[test]
    fn overlong_route_is_refused() {
        let msg = Message::request(1, "r".repeat(256), Vec::new());
        assert_eq!(msg.encode(), Err(ProtocolError::RouteTooLong(256)));
    }

    #[test]
    fn json_form_uses_numeric_type_and_base64_data() {
        let msg = Message::request(2, "hall.userHandler.updateUserAddress", b"hi".to_vec());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], 0);
        assert_eq!(json["data"], "aGk=");
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}

//! Frame header codec
//!
//! Fixed-width, network byte order serialization of the fragment header.

use bytes::{Buf, BufMut};
use thiserror::Error;

use super::PacketType;

/// Header size: message_id(4) + type(1) + part(2) + payload_size(2) = 9 bytes
pub const HEADER_SIZE: usize = 9;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed header: need {needed} bytes, have {available}")]
    MalformedHeader { needed: usize, available: usize },

    #[error("Unknown packet type tag: {0:#04x}")]
    UnknownPacketType(u8),
}

/// Header preceding every fragment on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Message this fragment belongs to
    pub message_id: u32,
    /// Envelope type of the message
    pub kind: PacketType,
    /// 0-based fragment index within the message
    pub part: u16,
    /// Payload bytes carried by this fragment
    pub payload_size: u16,
}

impl FrameHeader {
    pub fn new(message_id: u32, kind: PacketType, part: u16, payload_size: u16) -> Self {
        Self {
            message_id,
            kind,
            part,
            payload_size,
        }
    }

    /// Size of the whole frame (header + payload)
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_size as usize
    }

    /// Serialize into a fixed-size array
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        let mut buf = &mut out[..];
        self.write(&mut buf);
        out
    }

    /// Append the serialized header to a buffer
    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.message_id);
        buf.put_u8(self.kind.to_byte());
        buf.put_u16(self.part);
        buf.put_u16(self.payload_size);
    }

    /// Parse a header from the front of `bytes`
    ///
    /// The caller is responsible for buffering at least [`HEADER_SIZE`] bytes.
    pub fn decode(mut bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CodecError::MalformedHeader {
                needed: HEADER_SIZE,
                available: bytes.len(),
            });
        }

        let message_id = bytes.get_u32();
        let tag = bytes.get_u8();
        let kind = PacketType::from_byte(tag).ok_or(CodecError::UnknownPacketType(tag))?;
        let part = bytes.get_u16();
        let payload_size = bytes.get_u16();

        Ok(Self {
            message_id,
            kind,
            part,
            payload_size,
        })
    }
}

//! Packet definitions
//!
//! Defines the application-facing packet envelope and the per-message
//! metadata that prefixes every message body.

use bytes::{Buf, BufMut, Bytes};
use std::fmt;

/// Size of the serialized [`MessageMeta`]: channel(4) + length(2)
pub const META_SIZE: usize = 6;

/// Packet type tag as carried in every frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Join = 0,
    Quit = 1,
    Data = 2,
    Error = 255,
}

impl PacketType {
    /// Get the wire tag
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Parse a wire tag
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PacketType::Join),
            1 => Some(PacketType::Quit),
            2 => Some(PacketType::Data),
            255 => Some(PacketType::Error),
            _ => None,
        }
    }

    /// Whether packets of this type carry application content
    pub fn is_application(self) -> bool {
        matches!(self, PacketType::Data | PacketType::Error)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Join => "JOIN",
            PacketType::Quit => "QUIT",
            PacketType::Data => "DATA",
            PacketType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Index of a peer in its node's peer table
///
/// Stable for as long as the peer occupies the slot; a slot is handed out
/// again once its peer disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u16);

impl PeerId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// A complete application packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Envelope type
    pub kind: PacketType,
    /// Application-chosen logical sub-stream
    pub channel: u32,
    /// Peer the packet came from
    pub peer: PeerId,
    /// Application payload
    pub payload: Bytes,
}

impl Packet {
    pub fn new(kind: PacketType, peer: PeerId, channel: u32, payload: Bytes) -> Self {
        Self {
            kind,
            channel,
            peer,
            payload,
        }
    }

    /// A payload-less lifecycle packet (JOIN/QUIT)
    pub fn lifecycle(kind: PacketType, peer: PeerId) -> Self {
        Self::new(kind, peer, 0, Bytes::new())
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Metadata at the front of every message body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    pub channel: u32,
    /// Application payload length following the metadata
    pub len: u16,
}

impl MessageMeta {
    pub fn new(channel: u32, len: u16) -> Self {
        Self { channel, len }
    }

    /// Total body length this metadata describes
    pub fn body_len(&self) -> usize {
        META_SIZE + self.len as usize
    }

    pub fn write(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.channel);
        buf.put_u16(self.len);
    }

    /// Read metadata from the front of a body; `None` if fewer than
    /// [`META_SIZE`] bytes are present
    pub fn read(mut body: &[u8]) -> Option<Self> {
        if body.len() < META_SIZE {
            return None;
        }
        let channel = body.get_u32();
        let len = body.get_u16();
        Some(Self { channel, len })
    }
}

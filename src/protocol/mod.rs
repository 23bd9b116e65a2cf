//! Protocol module - Defines the miknet wire protocol
//!
//! Every message travels as one or more fragments. Each fragment is a fixed
//! header followed by up to `fragment_capacity` payload bytes:
//! - 4 bytes message id (big-endian)
//! - 1 byte packet type
//! - 2 bytes fragment index (big-endian)
//! - 2 bytes fragment payload size (big-endian)
//!
//! The concatenated fragment payloads of one message form the message body,
//! which starts with a 6 byte [`MessageMeta`] (channel + payload length).

mod codec;
mod fragment;
mod packet;

pub use codec::*;
pub use fragment::*;
pub use packet::*;

/// Default fragment payload capacity in bytes
pub const DEFAULT_FRAGMENT_CAPACITY: u16 = 1200;

/// Default ceiling for a reassembled application payload
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Default port for miknet nodes
pub const DEFAULT_PORT: u16 = 6699;

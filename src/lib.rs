//! miknet - Peer-to-peer packet transport
//!
//! Delivers discrete, channel-tagged packets between nodes over stream
//! transports. Messages larger than one fragment are split on send and
//! reassembled on receipt; a single-threaded [`Node`] drives every connection
//! from one `poll(2)` loop.

pub mod buffer;
pub mod config;
pub mod network;
pub mod protocol;

pub use buffer::{BufferConfig, BufferError, GrowableBuffer};
pub use config::{Config, ConfigError};
pub use network::{IpVersion, Node, NodeConfig, NodeError, Peer, PeerState};
pub use protocol::{Packet, PacketType, PeerId};

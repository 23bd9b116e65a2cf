//! Network module - Peer connections and the polling reactor
//!
//! Provides:
//! - [`Node`], the single-threaded reactor owning the peer table
//! - [`Peer`], per-connection state and reassembly workspace
//! - thin transport wrappers over non-blocking TCP and `poll(2)`

mod node;
mod peer;
pub mod transport;

pub use node::*;
pub use peer::*;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::buffer::{BufferConfig, BufferError};
use crate::protocol::{
    fragment_count, PeerId, DEFAULT_FRAGMENT_CAPACITY, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PORT,
    META_SIZE,
};

/// Node errors
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    #[error("Poll failed: {0}")]
    Poll(std::io::Error),

    #[error("Peer table full ({max} peers)")]
    PeerTableFull { max: u16 },

    #[error("{0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Lost {peer}: {reason}")]
    PeerLost { peer: PeerId, reason: String },
}

impl NodeError {
    /// Whether the node itself can no longer make progress.
    ///
    /// Everything else concerns a single call or a single peer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NodeError::Poll(_) | NodeError::Accept(_) | NodeError::Buffer(_)
        )
    }
}

pub type NodeResult<T> = Result<T, NodeError>;

/// Address family of the listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

/// Configuration for a [`Node`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address family to listen on
    #[serde(default)]
    pub ip: IpVersion,
    /// Interface to bind to (default: all)
    pub bind_address: Option<String>,
    /// Port to listen on (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Size of the peer table
    #[serde(default = "default_max_peers")]
    pub max_peers: u16,
    /// Payload bytes per fragment
    #[serde(default = "default_fragment_capacity")]
    pub fragment_capacity: u16,
    /// Largest application payload accepted or sent
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Bytes requested per transport read
    #[serde(default = "default_read_size")]
    pub read_size: usize,
    /// How long `next_event` pumps the reactor before giving up (ms)
    #[serde(default = "default_event_timeout")]
    pub event_timeout_ms: u64,
    /// Outbound connect timeout (ms)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Packets a peer may complete before its handshake finishes
    #[serde(default = "default_max_held_packets")]
    pub max_held_packets: usize,
    /// Sizing policy for the packet and command buffers
    #[serde(default)]
    pub buffer: BufferConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_max_peers() -> u16 {
    32
}

fn default_fragment_capacity() -> u16 {
    DEFAULT_FRAGMENT_CAPACITY
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_read_size() -> usize {
    4096
}

fn default_event_timeout() -> u64 {
    100
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_max_held_packets() -> usize {
    64
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: IpVersion::default(),
            bind_address: None,
            port: default_port(),
            max_peers: default_max_peers(),
            fragment_capacity: default_fragment_capacity(),
            max_message_size: default_max_message_size(),
            read_size: default_read_size(),
            event_timeout_ms: default_event_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            max_held_packets: default_max_held_packets(),
            buffer: BufferConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Loopback-only configuration on an ephemeral port
    pub fn local() -> Self {
        Self {
            bind_address: Some("127.0.0.1".to_string()),
            port: 0,
            ..Default::default()
        }
    }

    pub fn with_max_peers(mut self, max_peers: u16) -> Self {
        self.max_peers = max_peers;
        self
    }

    pub fn with_fragment_capacity(mut self, capacity: u16) -> Self {
        self.fragment_capacity = capacity;
        self
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_millis(self.event_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reject settings the reactor cannot run with
    pub fn validate(&self) -> NodeResult<()> {
        let invalid = |msg: &str| Err(NodeError::InvalidConfig(msg.to_string()));

        if self.max_peers == 0 {
            return invalid("max_peers must be at least 1");
        }
        if self.fragment_capacity == 0 {
            return invalid("fragment_capacity must be at least 1");
        }
        if self.read_size == 0 {
            return invalid("read_size must be at least 1");
        }
        if self.max_message_size > u16::MAX as usize {
            return invalid("max_message_size cannot exceed 65535");
        }
        if self.buffer.shrink_after_rounds == 0 {
            return invalid("buffer.shrink_after_rounds must be at least 1");
        }
        let (parts, _) = fragment_count(
            META_SIZE + self.max_message_size,
            self.fragment_capacity as usize,
        );
        if parts > u16::MAX as usize + 1 {
            return invalid("fragment_capacity too small for max_message_size");
        }
        Ok(())
    }
}

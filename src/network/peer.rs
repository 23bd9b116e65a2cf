//! Peer connection state
//!
//! Manages a single peer slot of a node, including:
//! - The connection state machine (DISCONNECTED -> HANDSHAKING -> CONNECTED)
//! - Frame parsing and the reassembly workspace
//! - Traffic statistics

use bytes::{Bytes, BytesMut};
use std::net::{Shutdown, SocketAddr, TcpStream};
use thiserror::Error;

use super::transport::{self, IoOutcome};
use super::NodeConfig;
use crate::protocol::{
    Assembled, CodecError, FragmentError, FrameHeader, Packet, PacketType, PeerId, Reassembler,
    HEADER_SIZE,
};

/// Errors that end a single peer's connection
#[derive(Error, Debug)]
pub enum PeerError {
    #[error("Malformed frame: {0}")]
    Codec(#[from] CodecError),

    #[error("Reassembly failed: {0}")]
    Fragment(#[from] FragmentError),

    #[error("Handshake violation: more than {limit} packets before JOIN")]
    HoldOverflow { limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,
}

impl PeerError {
    /// Whether the peer broke the protocol, as opposed to losing its transport
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::Codec(_) | PeerError::Fragment(_) | PeerError::HoldOverflow { .. }
        )
    }
}

/// State of a peer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// No live transport
    Disconnected,
    /// Transport established, JOIN not yet received
    Handshaking,
    /// JOIN received, application traffic flows
    Connected,
}

/// Peer statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PeerStats {
    /// Bytes written to the transport
    pub bytes_sent: u64,
    /// Bytes read from the transport
    pub bytes_received: u64,
    /// Messages fully handed to the transport or the outbound queue
    pub messages_sent: u64,
    /// Messages fully reassembled
    pub messages_received: u64,
}

/// Packets produced by one [`Peer::ingest`] call
#[derive(Debug, Default)]
pub struct Ingested {
    /// Packets for the application, in completion order
    pub packets: Vec<Packet>,
    /// The peer sent QUIT; bytes after it were not processed
    pub quit: bool,
}

/// One slot of a node's peer table
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    state: PeerState,
    /// Bumped every time the slot takes a new connection
    generation: u32,
    reassembler: Reassembler,
    /// Bytes of a not yet complete frame
    read_buf: BytesMut,
    /// Packets completed while handshaking
    held: Vec<Packet>,
    max_held: usize,
    /// Outbound commands waiting in the node's queue
    queued: usize,
    stats: PeerStats,
}

impl Peer {
    /// Create an empty, disconnected slot
    pub fn new(id: PeerId, config: &NodeConfig) -> Self {
        Self {
            id,
            addr: None,
            stream: None,
            state: PeerState::Disconnected,
            generation: 0,
            reassembler: Reassembler::new(config.fragment_capacity, config.max_message_size),
            read_buf: BytesMut::with_capacity(config.read_size),
            held: Vec::new(),
            max_held: config.max_held_packets,
            queued: 0,
            stats: PeerStats::default(),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Remote address of the current (or last) connection
    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn stats(&self) -> &PeerStats {
        &self.stats
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Whether the slot holds a live transport
    pub fn is_open(&self) -> bool {
        self.state != PeerState::Disconnected
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    /// Fragments received so far of the message being reassembled
    pub fn pending_parts(&self) -> u32 {
        self.reassembler.pending_parts()
    }

    /// Whether outbound frames are waiting for writability
    pub fn has_backlog(&self) -> bool {
        self.queued > 0
    }

    pub(crate) fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    /// Take a new transport: DISCONNECTED -> HANDSHAKING.
    ///
    /// Counters restart for the new connection.
    pub(crate) fn attach(&mut self, stream: TcpStream, addr: SocketAddr) {
        debug_assert!(!self.is_open());
        self.stream = Some(stream);
        self.addr = Some(addr);
        self.state = PeerState::Handshaking;
        self.generation = self.generation.wrapping_add(1);
        self.stats = PeerStats::default();
        tracing::debug!("{} handshaking with {}", self.id, addr);
    }

    /// Release the transport: any state -> DISCONNECTED.
    ///
    /// Partial reassembly and held packets are discarded; counters are kept
    /// until the slot is reused.
    pub(crate) fn detach(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state = PeerState::Disconnected;
        self.reassembler.discard();
        self.read_buf.clear();
        self.held.clear();
        self.queued = 0;
    }

    pub(crate) fn mark_queued(&mut self) {
        self.queued += 1;
    }

    /// Forget queued commands; the node is about to re-queue what is left
    pub(crate) fn reset_queued(&mut self) {
        self.queued = 0;
    }

    pub(crate) fn record_message_sent(&mut self) {
        self.stats.messages_sent += 1;
    }

    /// Read whatever the transport has into `scratch`
    pub(crate) fn read(&mut self, scratch: &mut [u8]) -> Result<IoOutcome, PeerError> {
        let stream = self.stream.as_mut().ok_or(PeerError::Closed)?;
        Ok(transport::read(stream, scratch)?)
    }

    /// Write a frame, or the part of it the transport accepts.
    ///
    /// Returns the bytes that still need to go out. Frames are never written
    /// past a backlog, so byte order on the stream is preserved.
    pub(crate) fn transmit(&mut self, frame: Bytes) -> Result<Option<Bytes>, PeerError> {
        if self.queued > 0 {
            return Ok(Some(frame));
        }
        let stream = self.stream.as_mut().ok_or(PeerError::Closed)?;

        let mut rest = frame;
        while !rest.is_empty() {
            match transport::write(stream, &rest)? {
                IoOutcome::Transferred(n) => {
                    self.stats.bytes_sent += n as u64;
                    rest = rest.slice(n..);
                }
                IoOutcome::WouldBlock => return Ok(Some(rest)),
                IoOutcome::Closed => return Err(PeerError::Closed),
            }
        }
        Ok(None)
    }

    /// Feed raw transport bytes through the frame parser and reassembler
    pub fn ingest(&mut self, data: &[u8]) -> Result<Ingested, PeerError> {
        self.stats.bytes_received += data.len() as u64;
        self.read_buf.extend_from_slice(data);

        let mut out = Ingested::default();
        while self.read_buf.len() >= HEADER_SIZE {
            let header = FrameHeader::decode(&self.read_buf)?;
            if self.read_buf.len() < header.frame_len() {
                break;
            }

            let frame = self.read_buf.split_to(header.frame_len());
            tracing::trace!(
                "{} fragment {}/{} ({} bytes)",
                self.id,
                header.message_id,
                header.part,
                header.payload_size
            );

            if let Some(message) = self.reassembler.reassemble(&header, &frame[HEADER_SIZE..])? {
                self.stats.messages_received += 1;
                if !self.on_message(message, &mut out)? {
                    out.quit = true;
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Apply a complete message to the state machine. Returns false on QUIT.
    fn on_message(&mut self, message: Assembled, out: &mut Ingested) -> Result<bool, PeerError> {
        match message.kind {
            PacketType::Join => {
                if self.state == PeerState::Handshaking {
                    self.state = PeerState::Connected;
                    tracing::info!(
                        "{} connected ({} packets held)",
                        self.id,
                        self.held.len()
                    );
                    out.packets.push(Packet::lifecycle(PacketType::Join, self.id));
                    out.packets.append(&mut self.held);
                } else {
                    tracing::debug!("{} sent a duplicate JOIN", self.id);
                }
            }
            PacketType::Quit => {
                tracing::debug!("{} sent QUIT", self.id);
                return Ok(false);
            }
            PacketType::Data | PacketType::Error => {
                let packet = Packet::new(message.kind, self.id, message.channel, message.payload);
                if self.state == PeerState::Connected {
                    out.packets.push(packet);
                } else {
                    if self.held.len() >= self.max_held {
                        return Err(PeerError::HoldOverflow {
                            limit: self.max_held,
                        });
                    }
                    self.held.push(packet);
                }
            }
        }
        Ok(true)
    }
}

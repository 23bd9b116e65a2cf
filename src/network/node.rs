//! Node reactor
//!
//! A [`Node`] owns the listening socket, a fixed-size peer table and two
//! [`GrowableBuffer`]s: completed inbound packets and outbound frame bytes that
//! could not be written yet. Everything runs on the caller's thread; the only
//! place the node blocks is [`Node::poll`].

use bytes::Bytes;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};

use super::peer::{Peer, PeerError};
use super::transport::{self, DescriptorSet, IoOutcome};
use super::{NodeConfig, NodeError, NodeResult};
use crate::buffer::GrowableBuffer;
use crate::protocol::{build_body, encode_message, Packet, PacketType, PeerId};

/// Frame bytes waiting for their peer's transport to become writable
#[derive(Debug, Clone)]
pub struct Command {
    pub peer: PeerId,
    /// Connection generation the bytes belong to
    pub generation: u32,
    pub bytes: Bytes,
}

/// A miknet endpoint: listener, peer table and reactor
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    descriptors: DescriptorSet,
    /// Peer index behind each registered descriptor after the listener
    polled: Vec<u16>,
    peers: Vec<Peer>,
    /// Free slot indices; the most recently freed slot is reused first
    free: Vec<u16>,
    inbound: GrowableBuffer<Packet>,
    outbound: GrowableBuffer<Command>,
    next_message_id: u32,
    scratch: Vec<u8>,
}

impl Node {
    /// Validate `config` and open the listener
    pub fn create(config: NodeConfig) -> NodeResult<Self> {
        config.validate()?;

        let listener =
            transport::open_listener(config.ip, config.bind_address.as_deref(), config.port)?;
        let local_addr = listener.local_addr()?;

        let peers = (0..config.max_peers)
            .map(|index| Peer::new(PeerId(index), &config))
            .collect();
        let free = (0..config.max_peers).rev().collect();
        let inbound = GrowableBuffer::new(config.buffer)?;
        let outbound = GrowableBuffer::new(config.buffer)?;

        tracing::info!(
            "Node listening on {} ({} peer slots, fragment capacity {})",
            local_addr,
            config.max_peers,
            config.fragment_capacity
        );

        Ok(Self {
            scratch: vec![0u8; config.read_size],
            polled: Vec::with_capacity(config.max_peers as usize),
            config,
            listener,
            local_addr,
            descriptors: DescriptorSet::new(),
            peers,
            free,
            inbound,
            outbound,
            next_message_id: 0,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Slot lookup; the peer may be disconnected
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.index())
    }

    /// Peers with a live transport
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter().filter(|peer| peer.is_open())
    }

    pub fn peer_count(&self) -> usize {
        self.peers().count()
    }

    /// Outbound frames waiting for writability
    pub fn pending_commands(&self) -> usize {
        self.outbound.remaining()
    }

    /// Open a connection to another node and start the handshake
    pub fn connect<A: ToSocketAddrs>(&mut self, addr: A) -> NodeResult<PeerId> {
        if self.free.is_empty() {
            return Err(NodeError::PeerTableFull {
                max: self.config.max_peers,
            });
        }

        let mut last_error = None;
        for addr in addr.to_socket_addrs()? {
            match transport::connect(addr, self.config.connect_timeout()) {
                Ok(stream) => {
                    let id = self.admit(stream, addr)?;
                    tracing::info!("Connected to {} as {}", addr, id);
                    return Ok(id);
                }
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No address to connect to"))
            .into())
    }

    /// Put a fresh transport into a free slot and send our JOIN
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) -> NodeResult<PeerId> {
        let Some(index) = self.free.pop() else {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(NodeError::PeerTableFull {
                max: self.config.max_peers,
            });
        };

        let id = PeerId(index);
        self.peers[id.index()].attach(stream, addr);
        self.send_message(id, PacketType::Join, 0, &[])?;
        Ok(id)
    }

    /// Wait up to `timeout` for readiness and service every ready descriptor.
    ///
    /// Connections refused because the peer table is full are reported as
    /// [`NodeError::PeerTableFull`] once everything else has been handled.
    pub fn poll(&mut self, timeout: Duration) -> NodeResult<()> {
        // An empty outbound queue still ends a round so that a past burst
        // can be shrunk away.
        if self.outbound.is_empty() {
            self.outbound.clear();
        }

        self.descriptors.clear();
        self.descriptors.register(self.listener.as_raw_fd(), false);
        self.polled.clear();
        for peer in &self.peers {
            if let Some(stream) = peer.stream() {
                self.descriptors
                    .register(stream.as_raw_fd(), peer.has_backlog());
                self.polled.push(peer.id().0);
            }
        }

        let ready = self.descriptors.wait(timeout).map_err(NodeError::Poll)?;
        if ready == 0 {
            return Ok(());
        }

        let refused = if self.descriptors.readiness(0).readable {
            self.accept_pending()?
        } else {
            0
        };

        let mut writable = false;
        for slot in 0..self.polled.len() {
            let id = PeerId(self.polled[slot]);
            let readiness = self.descriptors.readiness(slot + 1);
            if readiness.readable || readiness.failed {
                self.service_readable(id)?;
            }
            writable |= readiness.writable;
        }

        if writable {
            self.flush_outbound()?;
        }

        if refused > 0 {
            return Err(NodeError::PeerTableFull {
                max: self.config.max_peers,
            });
        }
        Ok(())
    }

    /// Accept every pending connection; returns how many were refused
    fn accept_pending(&mut self) -> NodeResult<usize> {
        let mut refused = 0;
        loop {
            let (stream, addr) = match transport::accept(&self.listener) {
                Ok(Some(pair)) => pair,
                Ok(None) => break,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => return Err(NodeError::Accept(e)),
            };

            if self.free.is_empty() {
                tracing::warn!(
                    "Refusing {}: peer table full ({} peers)",
                    addr,
                    self.config.max_peers
                );
                let _ = stream.shutdown(Shutdown::Both);
                refused += 1;
                continue;
            }

            if let Err(e) = transport::configure_stream(&stream) {
                tracing::warn!("Dropping {}: {}", addr, e);
                continue;
            }

            match self.admit(stream, addr) {
                Ok(id) => tracing::info!("Accepted {} as {}", addr, id),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("Could not admit {}: {}", addr, e),
            }
        }
        Ok(refused)
    }

    /// Drain everything the peer's transport has to offer
    fn service_readable(&mut self, id: PeerId) -> NodeResult<()> {
        loop {
            let peer = &mut self.peers[id.index()];
            if !peer.is_open() {
                return Ok(());
            }

            let n = match peer.read(&mut self.scratch) {
                Ok(IoOutcome::Transferred(n)) => n,
                Ok(IoOutcome::WouldBlock) => return Ok(()),
                Ok(IoOutcome::Closed) => return self.disconnect(id, "connection closed", true),
                Err(e) => return self.fail_peer(id, e),
            };

            match peer.ingest(&self.scratch[..n]) {
                Ok(ingested) => {
                    for packet in ingested.packets {
                        self.inbound.push(packet)?;
                    }
                    if ingested.quit {
                        return self.disconnect(id, "remote quit", true);
                    }
                }
                Err(e) => return self.fail_peer(id, e),
            }
        }
    }

    /// One round of the outbound buffer: retry every queued frame in order
    fn flush_outbound(&mut self) -> NodeResult<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }

        for peer in &mut self.peers {
            peer.reset_queued();
        }

        let mut retained = Vec::new();
        let mut failed: Vec<(PeerId, PeerError)> = Vec::new();
        while let Some(command) = self.outbound.next_item() {
            let peer = &mut self.peers[command.peer.index()];
            if !peer.is_open()
                || peer.generation() != command.generation
                || failed.iter().any(|(id, _)| *id == command.peer)
            {
                continue;
            }

            match peer.transmit(command.bytes.clone()) {
                Ok(None) => {}
                Ok(Some(rest)) => {
                    peer.mark_queued();
                    retained.push(Command {
                        bytes: rest,
                        ..command.clone()
                    });
                }
                Err(e) => failed.push((command.peer, e)),
            }
        }

        self.outbound.clear();
        tracing::trace!("Outbound flush left {} commands", retained.len());
        for command in retained {
            self.outbound.push(command)?;
        }
        for (id, e) in failed {
            self.fail_peer(id, e)?;
        }
        Ok(())
    }

    /// Move a peer to DISCONNECTED and return its slot to the free list
    fn disconnect(&mut self, id: PeerId, reason: &str, notify: bool) -> NodeResult<()> {
        let peer = &mut self.peers[id.index()];
        if !peer.is_open() {
            return Ok(());
        }

        peer.detach();
        self.free.push(id.0);
        tracing::info!("{} disconnected: {}", id, reason);

        if notify {
            self.inbound.push(Packet::lifecycle(PacketType::Quit, id))?;
        }
        Ok(())
    }

    fn fail_peer(&mut self, id: PeerId, error: PeerError) -> NodeResult<()> {
        let reason = error.to_string();
        if error.is_protocol_violation() {
            tracing::warn!("Dropping {}: {}", id, reason);
            self.inbound.push(Packet::new(
                PacketType::Error,
                id,
                0,
                Bytes::from(reason.clone()),
            ))?;
        }
        self.disconnect(id, &reason, true)
    }

    /// Send a DATA message to a connected peer
    pub fn send(&mut self, id: PeerId, payload: &[u8], channel: u32) -> NodeResult<()> {
        self.send_application(id, PacketType::Data, payload, channel)
    }

    /// Send an ERROR message to a connected peer
    pub fn send_error(&mut self, id: PeerId, payload: &[u8], channel: u32) -> NodeResult<()> {
        self.send_application(id, PacketType::Error, payload, channel)
    }

    fn send_application(
        &mut self,
        id: PeerId,
        kind: PacketType,
        payload: &[u8],
        channel: u32,
    ) -> NodeResult<()> {
        let peer = self.peers.get(id.index()).ok_or(NodeError::UnknownPeer(id))?;
        if !peer.is_connected() {
            return Err(NodeError::PeerNotConnected(id));
        }
        if payload.len() > self.config.max_message_size {
            return Err(NodeError::MessageTooLarge {
                size: payload.len(),
                max: self.config.max_message_size,
            });
        }
        self.send_message(id, kind, channel, payload)
    }

    /// Fragment a message and write it, queueing whatever would block
    fn send_message(
        &mut self,
        id: PeerId,
        kind: PacketType,
        channel: u32,
        payload: &[u8],
    ) -> NodeResult<()> {
        let body = build_body(channel, payload).map_err(|_| NodeError::MessageTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        })?;
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);

        let frames = encode_message(message_id, kind, &body, self.config.fragment_capacity);
        tracing::trace!(
            "Sending {} message {} to {} in {} fragments",
            kind,
            message_id,
            id,
            frames.len()
        );

        let peer = &mut self.peers[id.index()];
        let generation = peer.generation();
        for frame in frames {
            match peer.transmit(frame) {
                Ok(None) => {}
                Ok(Some(rest)) => {
                    if !peer.has_backlog() {
                        tracing::debug!("{} would block, queueing", id);
                    }
                    peer.mark_queued();
                    self.outbound.push(Command {
                        peer: id,
                        generation,
                        bytes: rest,
                    })?;
                }
                Err(e) => {
                    let reason = e.to_string();
                    self.fail_peer(id, e)?;
                    return Err(NodeError::PeerLost { peer: id, reason });
                }
            }
        }
        peer.record_message_sent();
        Ok(())
    }

    /// Close a peer without notifying the application.
    ///
    /// A QUIT is written if the transport accepts it right away; any partial
    /// reassembly is discarded.
    pub fn close_peer(&mut self, id: PeerId) -> NodeResult<()> {
        let capacity = self.config.fragment_capacity;
        let peer = match self.peers.get_mut(id.index()) {
            Some(peer) if peer.is_open() => peer,
            Some(_) => return Err(NodeError::PeerNotConnected(id)),
            None => return Err(NodeError::UnknownPeer(id)),
        };

        if let Ok(body) = build_body(0, &[]) {
            for frame in encode_message(self.next_message_id, PacketType::Quit, &body, capacity) {
                if !matches!(peer.transmit(frame), Ok(None)) {
                    tracing::debug!("{}: QUIT not delivered", id);
                    break;
                }
            }
            self.next_message_id = self.next_message_id.wrapping_add(1);
        }

        self.disconnect(id, "closed locally", false)
    }

    /// Next packet, pumping the reactor for up to `event_timeout_ms`
    pub fn next_event(&mut self) -> NodeResult<Option<Packet>> {
        self.next_event_timeout(self.config.event_timeout())
    }

    /// Next packet, pumping the reactor for up to `timeout`.
    ///
    /// `Duration::ZERO` performs a single non-blocking readiness check; a
    /// timeout too large to represent as a deadline waits until a packet
    /// arrives. Every call that finds the inbound buffer drained ends one of
    /// its rounds. Errors that only concern one peer or one accept are logged, not
    /// returned.
    pub fn next_event_timeout(&mut self, timeout: Duration) -> NodeResult<Option<Packet>> {
        if let Some(packet) = self.inbound.next_item() {
            return Ok(Some(packet.clone()));
        }
        self.inbound.clear();

        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining = deadline.map_or(timeout, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            match self.poll(remaining) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!("{}", e),
            }

            if let Some(packet) = self.inbound.next_item() {
                return Ok(Some(packet.clone()));
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        for peer in &mut self.peers {
            if peer.is_open() {
                peer.detach();
            }
        }
        tracing::debug!("Node on {} shut down", self.local_addr);
    }
}

//! Shared helpers for node integration tests

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use bytes::Bytes;
use miknet::protocol::{build_body, encode_message, DEFAULT_FRAGMENT_CAPACITY};
use miknet::{Node, NodeConfig, Packet, PacketType, PeerId};

pub const DEADLINE: Duration = Duration::from_secs(5);

/// A loopback node on an ephemeral port
pub fn node(config: NodeConfig) -> Node {
    Node::create(config).expect("node")
}

/// Every packet `node` yields within a short window
pub fn drain(node: &mut Node) -> Vec<Packet> {
    let mut packets = Vec::new();
    while let Some(packet) = node.next_event_timeout(Duration::from_millis(5)).unwrap() {
        packets.push(packet);
    }
    packets
}

/// Pump `node` until `done` holds for the packets seen so far
pub fn pump_until(node: &mut Node, mut done: impl FnMut(&[Packet]) -> bool) -> Vec<Packet> {
    let deadline = Instant::now() + DEADLINE;
    let mut seen = Vec::new();
    while !done(&seen) {
        assert!(Instant::now() < deadline, "timed out, saw {:?}", seen);
        seen.extend(drain(node));
    }
    seen
}

/// Pump two nodes until `done` holds for their packets so far
pub fn pump_pair_until(
    a: &mut Node,
    b: &mut Node,
    mut done: impl FnMut(&[Packet], &[Packet]) -> bool,
) -> (Vec<Packet>, Vec<Packet>) {
    let deadline = Instant::now() + DEADLINE;
    let (mut from_a, mut from_b) = (Vec::new(), Vec::new());
    while !done(&from_a, &from_b) {
        assert!(
            Instant::now() < deadline,
            "timed out, a saw {:?}, b saw {:?}",
            from_a,
            from_b
        );
        from_a.extend(drain(a));
        from_b.extend(drain(b));
    }
    (from_a, from_b)
}

pub fn has(packets: &[Packet], kind: PacketType) -> bool {
    packets.iter().any(|p| p.kind == kind)
}

/// Connect `a` to `b` and finish the handshake.
///
/// Returns `b` as seen from `a` and `a` as seen from `b`.
pub fn connected_pair(a: &mut Node, b: &mut Node) -> (PeerId, PeerId) {
    let a_to_b = a.connect(b.local_addr()).expect("connect");
    let (_, from_b) = pump_pair_until(a, b, |from_a, from_b| {
        has(from_a, PacketType::Join) && has(from_b, PacketType::Join)
    });
    let b_to_a = from_b
        .iter()
        .find(|p| p.kind == PacketType::Join)
        .map(|p| p.peer)
        .expect("join");
    (a_to_b, b_to_a)
}

/// Wire frames of one message at the default fragment capacity
pub fn frames(message_id: u32, kind: PacketType, channel: u32, payload: &[u8]) -> Vec<Bytes> {
    let body = build_body(channel, payload).unwrap();
    encode_message(message_id, kind, &body, DEFAULT_FRAGMENT_CAPACITY)
}

/// A hand-driven peer speaking the wire format over a blocking socket
pub struct RawPeer {
    pub stream: TcpStream,
    next_id: u32,
}

impl RawPeer {
    pub fn connect(node: &Node) -> Self {
        let stream = TcpStream::connect(node.local_addr()).expect("raw connect");
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self { stream, next_id: 100 }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn send(&mut self, kind: PacketType, channel: u32, payload: &[u8]) {
        self.next_id += 1;
        for frame in frames(self.next_id, kind, channel, payload) {
            self.write(&frame);
        }
    }

    pub fn join(&mut self) {
        self.send(PacketType::Join, 0, &[]);
    }

    /// Read until the remote closes; true if the stream ended cleanly
    pub fn closed_by_remote(&mut self) -> bool {
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(e) => {
                    return e.kind() == std::io::ErrorKind::ConnectionReset;
                }
            }
        }
    }
}

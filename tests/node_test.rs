//! Loopback tests driving real nodes

mod common;

use std::time::{Duration, Instant};

use common::*;
use miknet::protocol::HEADER_SIZE;
use miknet::{NodeConfig, NodeError, PacketType, PeerId, PeerState};

#[test]
fn test_handshake_connects_both_sides() {
    let mut a = node(NodeConfig::local());
    let mut b = node(NodeConfig::local());

    let a_to_b = a.connect(b.local_addr()).unwrap();
    assert_eq!(a.peer(a_to_b).unwrap().state(), PeerState::Handshaking);
    assert!(matches!(
        a.send(a_to_b, b"too early", 0),
        Err(NodeError::PeerNotConnected(_))
    ));

    let (from_a, from_b) = pump_pair_until(&mut a, &mut b, |from_a, from_b| {
        has(from_a, PacketType::Join) && has(from_b, PacketType::Join)
    });
    assert_eq!(from_a[0].peer, a_to_b);
    assert!(from_a[0].is_empty());

    let b_to_a = from_b[0].peer;
    assert_eq!(a.peer(a_to_b).unwrap().state(), PeerState::Connected);
    assert_eq!(b.peer(b_to_a).unwrap().state(), PeerState::Connected);
    assert_eq!(a.peer_count(), 1);
    assert_eq!(b.peer_count(), 1);
    assert_eq!(a.peer(a_to_b).unwrap().addr(), Some(b.local_addr()));
}

#[test]
fn test_large_message_surfaces_after_last_fragment() {
    let mut receiver = node(NodeConfig::local());
    let mut raw = RawPeer::connect(&receiver);
    raw.join();
    let joined = pump_until(&mut receiver, |seen| has(seen, PacketType::Join));
    let id = joined[0].peer;

    let payload: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let wire = frames(7, PacketType::Data, 3, &payload);
    let sizes: Vec<usize> = wire.iter().map(|f| f.len() - HEADER_SIZE).collect();
    // 3000 payload bytes plus the 6 byte channel/length metadata
    assert_eq!(sizes, vec![1200, 1200, 606]);

    for (sent, frame) in wire.iter().enumerate().take(2) {
        raw.write(frame);
        let deadline = Instant::now() + DEADLINE;
        while receiver.peer(id).unwrap().pending_parts() != sent as u32 + 1 {
            assert!(Instant::now() < deadline);
            assert!(receiver
                .next_event_timeout(Duration::from_millis(5))
                .unwrap()
                .is_none());
        }
    }

    raw.write(&wire[2]);
    let packets = pump_until(&mut receiver, |seen| has(seen, PacketType::Data));
    assert_eq!(packets.len(), 1);
    assert_eq!(packets[0].peer, id);
    assert_eq!(packets[0].channel, 3);
    assert_eq!(packets[0].len(), 3000);
    assert_eq!(packets[0].payload.as_ref(), payload.as_slice());
    assert_eq!(receiver.peer(id).unwrap().pending_parts(), 0);
}

#[test]
fn test_node_to_node_exchange() {
    let mut a = node(NodeConfig::local());
    let mut b = node(NodeConfig::local());
    let (a_to_b, b_to_a) = connected_pair(&mut a, &mut b);

    let big = vec![0xabu8; 3000];
    a.send(a_to_b, &big, 1).unwrap();
    a.send(a_to_b, b"", 2).unwrap();
    a.send_error(a_to_b, b"bad input", 9).unwrap();

    let (_, from_b) = pump_pair_until(&mut a, &mut b, |_, from_b| from_b.len() == 3);
    assert_eq!(from_b[0].kind, PacketType::Data);
    assert_eq!(from_b[0].payload.as_ref(), big.as_slice());
    assert_eq!(from_b[1].channel, 2);
    assert!(from_b[1].is_empty());
    assert_eq!(from_b[2].kind, PacketType::Error);
    assert_eq!(from_b[2].payload.as_ref(), b"bad input");
    assert!(from_b.iter().all(|p| p.peer == b_to_a));

    b.send(b_to_a, b"pong", 1).unwrap();
    let (from_a, _) = pump_pair_until(&mut a, &mut b, |from_a, _| !from_a.is_empty());
    assert_eq!(from_a[0].payload.as_ref(), b"pong");

    let stats = a.peer(a_to_b).unwrap().stats();
    assert_eq!(stats.messages_sent, 4);
    assert_eq!(stats.messages_received, 2);
}

#[test]
fn test_message_too_large() {
    let config = NodeConfig {
        max_message_size: 2000,
        ..NodeConfig::local()
    };
    let mut a = node(config.clone());
    let mut b = node(config);
    let (a_to_b, _) = connected_pair(&mut a, &mut b);

    assert!(matches!(
        a.send(a_to_b, &[0u8; 2001], 0),
        Err(NodeError::MessageTooLarge { size: 2001, max: 2000 })
    ));
    a.send(a_to_b, &[0u8; 2000], 0).unwrap();
}

#[test]
fn test_oversize_declared_length_drops_peer() {
    let mut receiver = node(NodeConfig {
        max_message_size: 100,
        ..NodeConfig::local()
    });
    let mut raw = RawPeer::connect(&receiver);
    raw.join();
    pump_until(&mut receiver, |seen| has(seen, PacketType::Join));

    raw.send(PacketType::Data, 0, &[1u8; 101]);
    let packets = pump_until(&mut receiver, |seen| has(seen, PacketType::Quit));
    assert_eq!(packets[0].kind, PacketType::Error);
    assert_eq!(receiver.peer_count(), 0);
    assert!(raw.closed_by_remote());
}

#[test]
fn test_peer_table_full_refuses_third_connection() {
    let mut server = node(NodeConfig::local().with_max_peers(2));

    let mut first = RawPeer::connect(&server);
    let _second = RawPeer::connect(&server);
    let deadline = Instant::now() + DEADLINE;
    while server.peer_count() < 2 {
        assert!(Instant::now() < deadline);
        server.poll(Duration::from_millis(10)).unwrap();
    }

    let mut third = RawPeer::connect(&server);
    let deadline = Instant::now() + DEADLINE;
    loop {
        assert!(Instant::now() < deadline);
        match server.poll(Duration::from_millis(10)) {
            Err(NodeError::PeerTableFull { max }) => {
                assert_eq!(max, 2);
                break;
            }
            Err(e) => panic!("unexpected error: {}", e),
            Ok(()) => {}
        }
    }
    assert!(!NodeError::PeerTableFull { max: 2 }.is_fatal());
    assert!(third.closed_by_remote());

    assert_eq!(server.peer_count(), 2);
    assert!(server
        .peers()
        .all(|peer| peer.state() == PeerState::Handshaking));

    first.join();
    pump_until(&mut server, |seen| has(seen, PacketType::Join));
    let states: Vec<PeerState> = server.peers().map(|p| p.state()).collect();
    assert!(states.contains(&PeerState::Connected));
    assert!(states.contains(&PeerState::Handshaking));
}

#[test]
fn test_out_of_order_fragment_disconnects_only_offender() {
    let mut server = node(NodeConfig::local());
    let mut good = RawPeer::connect(&server);
    let mut bad = RawPeer::connect(&server);
    good.join();
    bad.join();
    let joined = pump_until(&mut server, |seen| {
        seen.iter().filter(|p| p.kind == PacketType::Join).count() == 2
    });
    assert_eq!(server.peer_count(), 2);

    let wire = frames(50, PacketType::Data, 0, &[5u8; 3000]);
    bad.write(&wire[0]);
    bad.write(&wire[2]);

    let packets = pump_until(&mut server, |seen| has(seen, PacketType::Quit));
    let offender = packets[0].peer;
    assert_eq!(packets[0].kind, PacketType::Error);
    assert!(String::from_utf8_lossy(&packets[0].payload).contains("Unexpected fragment"));
    assert_eq!(packets[1], miknet::Packet::lifecycle(PacketType::Quit, offender));
    assert_eq!(server.peer(offender).unwrap().state(), PeerState::Disconnected);
    assert!(bad.closed_by_remote());

    let survivor = joined
        .iter()
        .map(|p| p.peer)
        .find(|id| *id != offender)
        .unwrap();
    assert_eq!(server.peer(survivor).unwrap().state(), PeerState::Connected);

    good.send(PacketType::Data, 4, b"still here");
    let packets = pump_until(&mut server, |seen| has(seen, PacketType::Data));
    assert_eq!(packets[0].peer, survivor);
    assert_eq!(packets[0].payload.as_ref(), b"still here");
}

#[test]
fn test_quit_disconnects_and_slot_is_reused() {
    let mut server = node(NodeConfig::local().with_max_peers(1));

    let mut first = RawPeer::connect(&server);
    first.join();
    let joined = pump_until(&mut server, |seen| has(seen, PacketType::Join));
    assert_eq!(joined[0].peer, PeerId(0));

    first.send(PacketType::Quit, 0, &[]);
    let left = pump_until(&mut server, |seen| has(seen, PacketType::Quit));
    assert_eq!(left[0].peer, PeerId(0));
    assert_eq!(server.peer(PeerId(0)).unwrap().state(), PeerState::Disconnected);
    assert_eq!(server.peer_count(), 0);

    let mut second = RawPeer::connect(&server);
    second.join();
    let joined = pump_until(&mut server, |seen| has(seen, PacketType::Join));
    assert_eq!(joined[0].peer, PeerId(0));
    assert_eq!(server.peer(PeerId(0)).unwrap().state(), PeerState::Connected);
}

#[test]
fn test_data_before_join_is_released_after_join() {
    let mut server = node(NodeConfig::local());
    let mut raw = RawPeer::connect(&server);
    raw.send(PacketType::Data, 1, b"first");
    raw.send(PacketType::Data, 1, b"second");
    raw.join();

    let packets = pump_until(&mut server, |seen| seen.len() == 3);
    let kinds: Vec<PacketType> = packets.iter().map(|p| p.kind).collect();
    assert_eq!(kinds, vec![PacketType::Join, PacketType::Data, PacketType::Data]);
    assert_eq!(packets[1].payload.as_ref(), b"first");
    assert_eq!(packets[2].payload.as_ref(), b"second");
}

#[test]
fn test_close_peer_is_silent_locally() {
    let mut a = node(NodeConfig::local());
    let mut b = node(NodeConfig::local());
    let (a_to_b, b_to_a) = connected_pair(&mut a, &mut b);

    a.close_peer(a_to_b).unwrap();
    assert_eq!(a.peer(a_to_b).unwrap().state(), PeerState::Disconnected);
    assert!(matches!(
        a.close_peer(a_to_b),
        Err(NodeError::PeerNotConnected(_))
    ));

    let from_b = pump_until(&mut b, |seen| has(seen, PacketType::Quit));
    assert_eq!(from_b[0].peer, b_to_a);
    assert!(drain(&mut a).is_empty());
}

#[test]
fn test_remote_drop_surfaces_quit() {
    let mut server = node(NodeConfig::local());
    let mut raw = RawPeer::connect(&server);
    raw.join();
    pump_until(&mut server, |seen| has(seen, PacketType::Join));

    drop(raw);
    let packets = pump_until(&mut server, |seen| has(seen, PacketType::Quit));
    assert_eq!(packets.len(), 1);
    assert_eq!(server.peer_count(), 0);
}

#[test]
fn test_backlog_is_flushed_in_order() {
    let mut a = node(NodeConfig::local());
    let mut b = node(NodeConfig::local());
    let (a_to_b, _) = connected_pair(&mut a, &mut b);

    // fill the socket buffers without letting b read
    let chunk = vec![0x5au8; 60_000];
    let mut sent = 0u32;
    while a.pending_commands() == 0 {
        assert!(sent < 10_000, "transport never pushed back");
        let mut payload = sent.to_be_bytes().to_vec();
        payload.extend_from_slice(&chunk);
        a.send(a_to_b, &payload, 0).unwrap();
        sent += 1;
    }
    for _ in 0..5 {
        let mut payload = sent.to_be_bytes().to_vec();
        payload.extend_from_slice(&chunk);
        a.send(a_to_b, &payload, 0).unwrap();
        sent += 1;
    }
    assert!(a.peer(a_to_b).unwrap().has_backlog());

    let (_, from_b) = pump_pair_until(&mut a, &mut b, |_, from_b| from_b.len() == sent as usize);
    for (index, packet) in from_b.iter().enumerate() {
        assert_eq!(packet.kind, PacketType::Data);
        assert_eq!(packet.len(), 60_004);
        assert_eq!(&packet.payload[..4], &(index as u32).to_be_bytes());
    }
    assert_eq!(a.pending_commands(), 0);
    assert!(!a.peer(a_to_b).unwrap().has_backlog());
}

mod common;

use common::*;
use rustrial_net::config::StackConfig;
use rustrial_net::net::checksum::pseudo_header_checksum;
use rustrial_net::net::ipv4::{protocol, Ipv4Addr};
use rustrial_net::net::udp::{self, UdpPacket, EPHEMERAL_PORT_START};
use rustrial_net::NetError;

#[test]
fn test_send_builds_checksummed_datagram() {
    let (stack, _iface, wire) = stack_with_peer();
    udp::send(&stack, PEER_IP, 7, 5000, b"echo me").unwrap();

    let sent = wire.sent();
    assert_eq!(sent.len(), 1);
    let (_, header, payload) = parse_ipv4(&sent[0]);
    assert_eq!(header.protocol, protocol::UDP);

    let packet = UdpPacket::from_bytes(&payload).unwrap();
    assert_eq!(packet.src_port, 5000);
    assert_eq!(packet.dest_port, 7);
    assert_eq!(packet.length, 15);
    assert_eq!(packet.data, b"echo me");
    assert_ne!(packet.checksum, 0);
    assert_eq!(pseudo_header_checksum(LOCAL_IP, PEER_IP, protocol::UDP, &payload), 0);
}

#[test]
fn test_send_rejects_empty_data() {
    let (stack, _iface, wire) = stack_with_peer();
    assert_eq!(udp::send(&stack, PEER_IP, 7, 5000, &[]), Err(NetError::InvalidArg));
    assert_eq!(wire.sent_count(), 0);
}

#[test]
fn test_inbound_datagram_is_queued_per_port() {
    let (stack, _iface, wire) = stack_with_peer();
    assert!(stack.udp().open(9000));

    for data in [&b"first"[..], &b"second"[..]] {
        let bytes = udp_bytes(PEER_IP, 1234, LOCAL_IP, 9000, data);
        wire.inject(ipv4_frame_from_peer(protocol::UDP, &bytes));
    }

    let first = udp::receive(&stack, 9000).unwrap();
    assert_eq!(first.src_ip, PEER_IP);
    assert_eq!(first.src_port, 1234);
    assert_eq!(first.data, b"first");
    assert_eq!(udp::receive(&stack, 9000).unwrap().data, b"second");
    assert_eq!(udp::receive(&stack, 9000), Err(NetError::NotFound));
}

#[test]
fn test_datagram_to_closed_port_is_dropped() {
    let (stack, _iface, _wire) = stack_with_peer();
    let bytes = udp_bytes(PEER_IP, 1234, LOCAL_IP, 9001, b"nobody home");
    assert_eq!(udp::handle_packet(&stack, PEER_IP, LOCAL_IP, &bytes), Err(NetError::NotFound));
    assert_eq!(stack.udp().pending(9001), 0);
}

#[test]
fn test_full_inbox_drops_new_datagrams() {
    let config = StackConfig::default().with_udp_queue_depth(2);
    let (stack, _iface, _wire) = configured_stack(config);
    stack.udp().open(9000);

    for n in 0..3u8 {
        let bytes = udp_bytes(PEER_IP, 1234, LOCAL_IP, 9000, &[n]);
        let result = udp::handle_packet(&stack, PEER_IP, LOCAL_IP, &bytes);
        if n < 2 {
            assert_eq!(result, Ok(()));
        } else {
            assert_eq!(result, Err(NetError::OutOfMemory));
        }
    }
    assert_eq!(stack.udp().pop(9000).unwrap().data, vec![0]);
    assert_eq!(stack.udp().pop(9000).unwrap().data, vec![1]);
}

#[test]
fn test_malformed_datagram() {
    let (stack, _iface, _wire) = stack_with_peer();
    stack.udp().open(9000);
    let mut bytes = udp_bytes(PEER_IP, 1234, LOCAL_IP, 9000, b"abc");
    bytes[5] = 200; // length past the end
    assert_eq!(udp::handle_packet(&stack, PEER_IP, LOCAL_IP, &bytes), Err(NetError::InvalidArg));
    assert_eq!(udp::handle_packet(&stack, PEER_IP, LOCAL_IP, &[0; 4]), Err(NetError::InvalidArg));
}

#[test]
fn test_ephemeral_ports_skip_open_ones() {
    let (stack, _iface, _wire) = stack_with_peer();
    stack.udp().open(EPHEMERAL_PORT_START);
    assert_eq!(stack.udp().open_ephemeral(), Ok(EPHEMERAL_PORT_START + 1));
    assert!(!stack.udp().open(EPHEMERAL_PORT_START + 1));
    stack.udp().close(EPHEMERAL_PORT_START);
    assert!(!stack.udp().is_open(EPHEMERAL_PORT_START));
}

#[test]
fn test_send_via_unconfigured_interface_broadcast() {
    let (stack, iface, wire) = bare_stack(StackConfig::default());
    udp::send_via(&stack, &iface, Ipv4Addr::BROADCAST, 67, 68, b"discover").unwrap();

    let (_, header, payload) = parse_ipv4(&wire.sent()[0]);
    assert_eq!(header.src_ip, Ipv4Addr::UNSPECIFIED);
    let packet = UdpPacket::from_bytes(&payload).unwrap();
    assert_eq!((packet.src_port, packet.dest_port), (68, 67));
}

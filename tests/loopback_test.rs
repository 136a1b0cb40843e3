mod common;

use std::net::SocketAddrV4;
use std::sync::Arc;

use common::SteppingClock;
use rustrial_net::config::StackConfig;
use rustrial_net::drivers::net::loopback::LoopbackDevice;
use rustrial_net::drivers::net::DeviceKind;
use rustrial_net::net::arp;
use rustrial_net::net::icmp;
use rustrial_net::net::ipv4::Ipv4Addr;
use rustrial_net::net::socket::{self, SocketType, AF_INET};
use rustrial_net::net::stack::NetworkStack;
use rustrial_net::net::tcp;
use rustrial_net::net::udp;

const LOCALHOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

fn loopback_stack() -> NetworkStack {
    let stack = NetworkStack::new(
        StackConfig::default().with_primary_device("lo"),
        Arc::new(SteppingClock::new(1)),
    );
    let iface = stack.register_device(Box::new(LoopbackDevice::default()));
    assert_eq!(iface.kind(), DeviceKind::Loopback);
    stack
        .set_ip("lo", LOCALHOST, Ipv4Addr::new(255, 0, 0, 0), None)
        .unwrap();
    stack
}

/// Learn our own MAC by asking ourselves over the loopback
fn resolve_self(stack: &NetworkStack) {
    let iface = stack.primary_interface().unwrap();
    assert_eq!(arp::resolve_blocking(stack, &iface, LOCALHOST, 100), Ok(iface.mac()));
}

#[test]
fn test_arp_answers_itself() {
    let stack = loopback_stack();
    resolve_self(&stack);
    assert_eq!(stack.arp().len(), 1);
}

#[test]
fn test_ping_self() {
    let stack = loopback_stack();
    assert!(icmp::ping(&stack, LOCALHOST).is_ok());
    assert!(stack.echo().is_empty());
}

#[test]
fn test_udp_to_self() {
    let stack = loopback_stack();
    resolve_self(&stack);
    stack.udp().open(7000);

    udp::send(&stack, LOCALHOST, 7000, 7001, b"over the loop").unwrap();
    let datagram = udp::receive(&stack, 7000).unwrap();
    assert_eq!(datagram.src_ip, LOCALHOST);
    assert_eq!(datagram.src_port, 7001);
    assert_eq!(datagram.data, b"over the loop");
}

#[test]
fn test_tcp_to_self() {
    let stack = loopback_stack();
    resolve_self(&stack);

    let listener = tcp::listen(&stack, 80).unwrap();
    let client = tcp::connect(&stack, LOCALHOST, 80, 0).unwrap();
    stack.poll();

    let server = tcp::accept(&stack, listener).unwrap().unwrap();
    assert_eq!(tcp::send(&stack, client, b"hello, self"), Ok(11));

    let mut buf = [0u8; 32];
    let n = tcp::receive(&stack, server, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello, self");

    tcp::send(&stack, server, b"hi back").unwrap();
    let n = tcp::receive(&stack, client, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"hi back");
}

#[test]
fn test_sockets_over_loopback() {
    let stack = loopback_stack();
    resolve_self(&stack);

    let server = socket::create(&stack, AF_INET, SocketType::Datagram, 0).unwrap();
    socket::bind(&stack, server, SocketAddrV4::new(LOCALHOST, 5300)).unwrap();

    let client = socket::create(&stack, AF_INET, SocketType::Datagram, 0).unwrap();
    socket::send_to(&stack, client, b"who?", SocketAddrV4::new(LOCALHOST, 5300)).unwrap();

    let mut buf = [0u8; 8];
    let (n, from) = socket::recv_from(&stack, server, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"who?");
    assert_eq!(*from.ip(), LOCALHOST);

    socket::send_to(&stack, server, b"me", from).unwrap();
    let n = socket::recv(&stack, client, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"me");
}

//! Shared fixtures for the integration tests
//!
//! [`TestDevice`] is a driver whose wire is visible to the test: frames the
//! stack transmits land in `Wire::sent`, frames injected with `Wire::inject`
//! come back out of `receive`. A responder closure can play the remote peer.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use spin::Mutex;

use rustrial_net::config::StackConfig;
use rustrial_net::drivers::net::{DeviceKind, LinkStatus, NetworkDevice, TransmitError};
use rustrial_net::net::ethernet::{EthernetFrame, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use rustrial_net::net::interface::NetInterface;
use rustrial_net::net::ipv4::{Ipv4Addr, Ipv4Header};
use rustrial_net::net::stack::NetworkStack;
use rustrial_net::net::udp::UdpPacket;
use rustrial_net::timer::Clock;

pub const LOCAL_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
pub const PEER_MAC: [u8; 6] = [0x52, 0x55, 0x0A, 0x00, 0x02, 0x02];
pub const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

const WIRE_DEPTH: usize = 256;

/// Builds reply frames for one transmitted frame
pub type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

/// Both directions of a test device's link
pub struct Wire {
    tx: ArrayQueue<Vec<u8>>,
    rx: ArrayQueue<Vec<u8>>,
    responder: Mutex<Option<Responder>>,
}

impl Wire {
    /// Queue a frame for the stack to receive
    pub fn inject(&self, frame: Vec<u8>) {
        self.rx.push(frame).expect("rx queue full");
    }

    /// Drain everything the stack has transmitted so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.tx.pop()).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.tx.len()
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.len()
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }
}

pub struct TestDevice {
    name: String,
    mac: [u8; 6],
    kind: DeviceKind,
    link: LinkStatus,
    wire: Arc<Wire>,
}

impl TestDevice {
    pub fn new(name: &str, mac: [u8; 6]) -> (Self, Arc<Wire>) {
        let wire = Arc::new(Wire {
            tx: ArrayQueue::new(WIRE_DEPTH),
            rx: ArrayQueue::new(WIRE_DEPTH),
            responder: Mutex::new(None),
        });
        let device = Self {
            name: name.to_string(),
            mac,
            kind: DeviceKind::Ethernet,
            link: LinkStatus::Up,
            wire: wire.clone(),
        };
        (device, wire)
    }

    pub fn with_link(mut self, link: LinkStatus) -> Self {
        self.link = link;
        self
    }

    pub fn with_kind(mut self, kind: DeviceKind) -> Self {
        self.kind = kind;
        self
    }
}

impl NetworkDevice for TestDevice {
    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn transmit(&mut self, packet: &[u8]) -> Result<(), TransmitError> {
        self.wire.tx.push(packet.to_vec()).map_err(|_| TransmitError::BufferFull)?;
        if let Some(responder) = self.wire.responder.lock().as_ref() {
            for reply in responder(packet) {
                let _ = self.wire.rx.push(reply);
            }
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<Vec<u8>> {
        self.wire.rx.pop()
    }

    fn link_status(&self) -> LinkStatus {
        self.link
    }

    fn device_name(&self) -> &str {
        &self.name
    }

    fn device_kind(&self) -> DeviceKind {
        self.kind
    }
}

/// Clock that only moves while someone waits on it
pub struct SteppingClock {
    now: AtomicU64,
    step: u64,
}

impl SteppingClock {
    pub fn new(step: u64) -> Self {
        Self {
            now: AtomicU64::new(0),
            step,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::Relaxed);
    }
}

impl Clock for SteppingClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn relax(&self) {
        self.now.fetch_add(self.step, Ordering::Relaxed);
    }
}

/// Stack with `eth0` registered and configured as 10.0.2.15/24 via 10.0.2.2
pub fn configured_stack(config: StackConfig) -> (NetworkStack, Arc<NetInterface>, Arc<Wire>) {
    let (stack, iface, wire) = bare_stack(config);
    stack
        .set_ip("eth0", LOCAL_IP, NETMASK, Some(PEER_IP))
        .expect("eth0 registered");
    (stack, iface, wire)
}

/// Stack with an unconfigured `eth0`
pub fn bare_stack(config: StackConfig) -> (NetworkStack, Arc<NetInterface>, Arc<Wire>) {
    let stack = NetworkStack::new(config, Arc::new(SteppingClock::new(10)));
    let (device, wire) = TestDevice::new("eth0", LOCAL_MAC);
    let iface = stack.register_device(Box::new(device));
    (stack, iface, wire)
}

/// Default stack that already knows the peer's MAC
pub fn stack_with_peer() -> (NetworkStack, Arc<NetInterface>, Arc<Wire>) {
    let (stack, iface, wire) = configured_stack(StackConfig::default());
    stack.arp().insert(PEER_IP, PEER_MAC, 0);
    (stack, iface, wire)
}

pub fn frame(dest: [u8; 6], src: [u8; 6], ethertype: u16, payload: Vec<u8>) -> Vec<u8> {
    EthernetFrame::new(dest, src, ethertype, payload).to_bytes()
}

pub fn ipv4_packet(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Vec<u8> {
    let header = Ipv4Header::new(src, dst, protocol, payload.len() as u16);
    let mut packet = header.to_bytes().to_vec();
    packet.extend_from_slice(payload);
    packet
}

/// IPv4 frame from the peer to us
pub fn ipv4_frame_from_peer(protocol: u8, payload: &[u8]) -> Vec<u8> {
    frame(LOCAL_MAC, PEER_MAC, ETHERTYPE_IPV4, ipv4_packet(PEER_IP, LOCAL_IP, protocol, payload))
}

pub fn udp_bytes(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, data: &[u8]) -> Vec<u8> {
    let mut packet = UdpPacket::new(src_port, dst_port, data.to_vec());
    packet.checksum = packet.calculate_checksum(src, dst);
    packet.to_bytes()
}

/// Split a transmitted frame into its Ethernet frame, IPv4 header and IP payload
pub fn parse_ipv4(raw: &[u8]) -> (EthernetFrame, Ipv4Header, Vec<u8>) {
    let eth = EthernetFrame::from_bytes(raw).expect("ethernet frame");
    assert_eq!(eth.ethertype, ETHERTYPE_IPV4, "not an IPv4 frame");
    let (header, _) = Ipv4Header::from_bytes(&eth.payload).expect("ipv4 header");
    let payload = header.payload(&eth.payload).to_vec();
    (eth, header, payload)
}

pub fn is_arp(raw: &[u8]) -> bool {
    EthernetFrame::from_bytes(raw).map_or(false, |f| f.ethertype == ETHERTYPE_ARP)
}

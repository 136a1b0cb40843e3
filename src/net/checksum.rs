//! Internet checksum (RFC 1071)
//!
//! Shared by IPv4 (header only), ICMP (whole message) and UDP/TCP
//! (pseudo-header plus segment).

use core::net::Ipv4Addr;

/// Add `data` to a running one's complement sum as big-endian 16-bit words
///
/// An odd trailing byte is padded with zero on the right.
pub fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    sum
}

/// Fold carries back into 16 bits and complement
pub fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

/// Checksum of a contiguous buffer (checksum field must be zero, or the
/// buffer must include it when verifying)
pub fn internet_checksum(data: &[u8]) -> u16 {
    finish(accumulate(0, data))
}

/// Checksum over the IPv4 pseudo-header followed by `segment`
///
/// Pseudo-header: src (4), dst (4), zero (1), protocol (1), length (2).
pub fn pseudo_header_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = accumulate(0, &src.octets());
    sum = accumulate(sum, &dst.octets());
    sum += protocol as u32;
    sum += segment.len() as u32;
    finish(accumulate(sum, segment))
}

//! Frame builders for tests
//!
//! Builds Ethernet/IPv4/IPv6 frames carrying a TCP or UDP 5-tuple. Transport
//! headers are only filled in as far as flow hashing looks at them.

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// MAC address used as the sender of generated frames
pub const PEER_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];

/// Destination MAC of generated frames (not the device, hence promiscuous mode)
pub const OTHER_MAC: [u8; 6] = [0x52, 0x54, 0x00, 0xab, 0xcd, 0xef];

const IPV4_HDR_SIZE: usize = 20;
const IPV6_HDR_SIZE: usize = 40;
const TCP_HDR_SIZE: usize = 20;
const UDP_HDR_SIZE: usize = 8;

/// Transport protocol of a generated flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4 {
    Tcp,
    Udp,
}

impl L4 {
    fn protocol(self) -> u8 {
        match self {
            L4::Tcp => 6,
            L4::Udp => 17,
        }
    }

    fn header_len(self) -> usize {
        match self {
            L4::Tcp => TCP_HDR_SIZE,
            L4::Udp => UDP_HDR_SIZE,
        }
    }
}

/// An IPv4 5-tuple plus the MAC addresses to put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSpec {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    pub src: Ipv4Addr,
    pub src_port: u16,
    pub dst: Ipv4Addr,
    pub dst_port: u16,
    pub l4: L4,
}

impl FlowSpec {
    pub fn tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            src_mac: PEER_MAC,
            dst_mac: OTHER_MAC,
            src,
            src_port,
            dst,
            dst_port,
            l4: L4::Tcp,
        }
    }

    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            l4: L4::Udp,
            ..Self::tcp(src, src_port, dst, dst_port)
        }
    }

    pub fn with_src_mac(mut self, mac: [u8; 6]) -> Self {
        self.src_mac = mac;
        self
    }
}

/// Build an Ethernet frame with the given payload
pub fn build_ethernet_frame(
    dst_mac: [u8; 6],
    src_mac: [u8; 6],
    ethertype: EthernetProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress(src_mac),
        dst_addr: EthernetAddress(dst_mac),
        ethertype,
    };

    let mut buffer = vec![0u8; repr.buffer_len() + payload.len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buffer);
    repr.emit(&mut frame);
    frame.payload_mut().copy_from_slice(payload);
    buffer
}

fn l4_header(l4: L4, src_port: u16, dst_port: u16, payload_len: usize) -> Vec<u8> {
    let mut hdr = vec![0u8; l4.header_len()];
    hdr[0..2].copy_from_slice(&src_port.to_be_bytes());
    hdr[2..4].copy_from_slice(&dst_port.to_be_bytes());
    match l4 {
        L4::Tcp => hdr[12] = (TCP_HDR_SIZE as u8 / 4) << 4,
        L4::Udp => {
            let len = (UDP_HDR_SIZE + payload_len) as u16;
            hdr[4..6].copy_from_slice(&len.to_be_bytes());
        }
    }
    hdr
}

fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in header.chunks(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build an Ethernet + IPv4 + TCP/UDP frame for `flow`
pub fn build_ipv4_frame(flow: &FlowSpec, payload: &[u8]) -> Vec<u8> {
    let l4 = l4_header(flow.l4, flow.src_port, flow.dst_port, payload.len());
    let total_len = IPV4_HDR_SIZE + l4.len() + payload.len();

    let mut ip = vec![0u8; IPV4_HDR_SIZE];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[6] = 0x40; // don't fragment
    ip[8] = 64;
    ip[9] = flow.l4.protocol();
    ip[12..16].copy_from_slice(&flow.src.octets());
    ip[16..20].copy_from_slice(&flow.dst.octets());
    let csum = ipv4_checksum(&ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());

    ip.extend_from_slice(&l4);
    ip.extend_from_slice(payload);
    build_ethernet_frame(flow.dst_mac, flow.src_mac, EthernetProtocol::Ipv4, &ip)
}

/// Build an Ethernet + IPv6 + TCP/UDP frame
pub fn build_ipv6_frame(
    src: Ipv6Addr,
    dst: Ipv6Addr,
    l4: L4,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let l4_hdr = l4_header(l4, src_port, dst_port, payload.len());
    let payload_len = l4_hdr.len() + payload.len();

    let mut ip = vec![0u8; IPV6_HDR_SIZE];
    ip[0] = 0x60;
    ip[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    ip[6] = l4.protocol();
    ip[7] = 64;
    ip[8..24].copy_from_slice(&src.octets());
    ip[24..40].copy_from_slice(&dst.octets());

    ip.extend_from_slice(&l4_hdr);
    ip.extend_from_slice(payload);
    build_ethernet_frame(OTHER_MAC, PEER_MAC, EthernetProtocol::Ipv6, &ip)
}

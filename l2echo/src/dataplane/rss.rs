//! Receive-side scaling: hash field selection, Toeplitz hash, redirection table
//!
//! The hash here is what a NIC computes in hardware. The forwarding path never
//! calls it; it is used by ports that distribute flows in software and to
//! predict which queue a flow lands on.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, Ipv6Packet};

/// RSS key length in bytes (enough for an IPv6 4-tuple)
pub const RSS_KEY_LEN: usize = 40;

/// Default redirection table size (power of two)
pub const RETA_SIZE: usize = 128;

/// Default RSS key, the one used by the RSS verification suite and most NIC
/// drivers out of the box.
pub const DEFAULT_RSS_KEY: [u8; RSS_KEY_LEN] = [
    0x6d, 0x5a, 0x56, 0xda, 0x25, 0x5b, 0x0e, 0xc2, 0x41, 0x67, 0x25, 0x3d, 0x43, 0xa3, 0x8f, 0xb0,
    0xd0, 0xca, 0x2b, 0xcb, 0xae, 0x7b, 0x30, 0xb4, 0x77, 0xcb, 0x2d, 0xa3, 0x80, 0x30, 0xf2, 0x0c,
    0x6a, 0x42, 0xb7, 0x3b, 0xbe, 0xac, 0x01, 0xfa,
];

/// Protocol fields that feed the flow hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RssHashFields(u8);

impl RssHashFields {
    pub const NONE: Self = Self(0);
    /// IPv4/IPv6 source and destination addresses
    pub const IP: Self = Self(1 << 0);
    /// Addresses plus TCP ports for TCP packets
    pub const TCP: Self = Self(1 << 1);
    /// Addresses plus UDP ports for UDP packets
    pub const UDP: Self = Self(1 << 2);
    pub const ALL: Self = Self(Self::IP.0 | Self::TCP.0 | Self::UDP.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for RssHashFields {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for RssHashFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [(Self::IP, "ip"), (Self::TCP, "tcp"), (Self::UDP, "udp")];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl FromStr for RssHashFields {
    type Err = String;

    /// Parse a comma separated list such as `ip,tcp,udp` (or `none`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = Self::NONE;
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            fields = fields
                | match part.to_ascii_lowercase().as_str() {
                    "ip" => Self::IP,
                    "tcp" => Self::TCP,
                    "udp" => Self::UDP,
                    "all" => Self::ALL,
                    "none" => Self::NONE,
                    other => return Err(format!("unknown RSS field '{other}'")),
                };
        }
        Ok(fields)
    }
}

/// RSS configuration requested from a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssConf {
    pub key: [u8; RSS_KEY_LEN],
    pub fields: RssHashFields,
}

impl RssConf {
    pub fn new(fields: RssHashFields) -> Self {
        Self {
            key: DEFAULT_RSS_KEY,
            fields,
        }
    }

    /// Hash a frame the way a NIC would for this configuration.
    ///
    /// Frames that carry nothing selected by `fields` hash to 0.
    pub fn hash_frame(&self, frame: &[u8]) -> u32 {
        let mut input = [0u8; 36];
        let len = hash_input(frame, self.fields, &mut input);
        if len == 0 {
            return 0;
        }
        toeplitz_hash(&self.key, &input[..len])
    }
}

impl Default for RssConf {
    fn default() -> Self {
        Self::new(RssHashFields::ALL)
    }
}

/// Toeplitz hash of `input` under `key`.
///
/// Inputs up to 36 bytes (IPv6 addresses plus ports) are supported.
pub fn toeplitz_hash(key: &[u8; RSS_KEY_LEN], input: &[u8]) -> u32 {
    debug_assert!(input.len() + 4 <= RSS_KEY_LEN);
    let mut hash = 0u32;
    let mut window = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
    for (i, byte) in input.iter().enumerate() {
        let next = key[i + 4];
        for bit in 0..8 {
            if byte & (0x80 >> bit) != 0 {
                hash ^= window;
            }
            window <<= 1;
            if next & (0x80 >> bit) != 0 {
                window |= 1;
            }
        }
    }
    hash
}

/// Write the hash input tuple for `frame` into `out`, returning its length.
fn hash_input(frame: &[u8], fields: RssHashFields, out: &mut [u8; 36]) -> usize {
    let Ok(eth) = EthernetFrame::new_checked(frame) else {
        return 0;
    };
    let payload = eth.payload();

    let (addrs, protocol, l4, fragmented) = match eth.ethertype() {
        EthernetProtocol::Ipv4 => {
            let Ok(ip) = Ipv4Packet::new_checked(payload) else {
                return 0;
            };
            let header_len = ip.header_len() as usize;
            let fragmented = ip.more_frags() || ip.frag_offset() != 0;
            (&payload[12..20], ip.next_header(), &payload[header_len..], fragmented)
        }
        EthernetProtocol::Ipv6 => {
            let Ok(ip) = Ipv6Packet::new_checked(payload) else {
                return 0;
            };
            (&payload[8..40], ip.next_header(), &payload[40..], false)
        }
        _ => return 0,
    };

    let with_ports = !fragmented
        && l4.len() >= 4
        && match protocol {
            IpProtocol::Tcp => fields.contains(RssHashFields::TCP),
            IpProtocol::Udp => fields.contains(RssHashFields::UDP),
            _ => false,
        };

    if !with_ports && !fields.contains(RssHashFields::IP) {
        return 0;
    }

    out[..addrs.len()].copy_from_slice(addrs);
    let mut len = addrs.len();
    if with_ports {
        out[len..len + 4].copy_from_slice(&l4[..4]);
        len += 4;
    }
    len
}

/// Redirection table mapping hash values to queue indices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectionTable {
    entries: Vec<u16>,
}

impl RedirectionTable {
    /// Spread `queues` round-robin over the table
    ///
    /// # Panics
    /// Panics if `queues` is zero.
    pub fn new(queues: u16) -> Self {
        assert!(queues > 0, "redirection table needs at least one queue");
        Self {
            entries: (0..RETA_SIZE).map(|i| (i % queues as usize) as u16).collect(),
        }
    }

    #[inline]
    pub fn queue_for(&self, hash: u32) -> u16 {
        self.entries[hash as usize & (self.entries.len() - 1)]
    }
}

/// Flow distributor combining an RSS configuration and a redirection table
#[derive(Debug, Clone)]
pub struct FlowDistributor {
    conf: RssConf,
    reta: RedirectionTable,
}

impl FlowDistributor {
    pub fn new(conf: RssConf, queues: u16) -> Self {
        Self {
            conf,
            reta: RedirectionTable::new(queues),
        }
    }

    pub fn queue_for_frame(&self, frame: &[u8]) -> u16 {
        self.reta.queue_for(self.conf.hash_frame(frame))
    }
}

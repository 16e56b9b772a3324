//! Network port abstraction
//!
//! A port is configured once from the control plane and then split into
//! per-queue halves. Each [`QueuePair`] is moved into exactly one forwarding
//! core, so a queue can never be polled by two cores.

use std::fmt;
use std::io;

use smoltcp::wire::EthernetAddress;
use thiserror::Error;

use super::buffer::{BufferPool, PoolBuffer};
use super::rss::{RssConf, RssHashFields};

/// Port errors.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("interface '{0}' not found")]
    NotFound(String),

    #[error("interface '{0}' is not an Ethernet device")]
    NotEthernet(String),

    #[error("interface '{0}' is down")]
    Down(String),

    #[error("requested {requested} {kind} queues, device supports 1..={max}")]
    QueueCount {
        kind: &'static str,
        requested: u16,
        max: u16,
    },

    #[error("multi-queue receive needs at least one RSS hash field")]
    NoRssFields,

    #[error("{kind} queue {queue} out of range ({configured} configured)")]
    InvalidQueue {
        kind: &'static str,
        queue: u16,
        configured: u16,
    },

    #[error("{kind} queue {queue} was not set up")]
    QueueNotSetUp { kind: &'static str, queue: u16 },

    #[error("port is {actual}, operation needs it {expected}")]
    InvalidState {
        expected: &'static str,
        actual: PortState,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<nix::Error> for PortError {
    fn from(e: nix::Error) -> Self {
        PortError::Io(io::Error::from(e))
    }
}

/// Port lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Unconfigured,
    Configured,
    Started,
    Stopped,
    Closed,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Unconfigured => "unconfigured",
            PortState::Configured => "configured",
            PortState::Started => "started",
            PortState::Stopped => "stopped",
            PortState::Closed => "closed",
        }
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptor ring limits of one queue direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescLimits {
    pub min: u16,
    pub max: u16,
    pub align: u16,
}

impl DescLimits {
    /// Clamp `depth` into the limits and round it up to the alignment
    pub fn adjust(&self, depth: u16) -> u16 {
        let mut d = depth.clamp(self.min, self.max);
        if self.align > 1 {
            let aligned = (d as u32).div_ceil(self.align as u32) * self.align as u32;
            d = if aligned > self.max as u32 {
                self.max - self.max % self.align
            } else {
                aligned as u16
            };
        }
        d
    }
}

/// What a device can do, read before configuring it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub driver: &'static str,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    /// Hash fields the device can distribute on
    pub rss_fields: RssHashFields,
    pub rx_desc: DescLimits,
    pub tx_desc: DescLimits,
}

/// Port configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConf {
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub rss: RssConf,
}

/// Receive half of a queue pair
pub trait RxQueue: Send {
    fn queue_id(&self) -> u16;

    /// Receive up to `max` frames, appending them to `pkts`.
    ///
    /// Never blocks. Returns the number of frames appended (0..=max).
    fn rx_burst(&mut self, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize;
}

/// Transmit half of a queue pair
pub trait TxQueue: Send {
    fn queue_id(&self) -> u16;

    /// Submit `pkts` for transmission.
    ///
    /// Never blocks. Returns the number of frames accepted; those are removed
    /// from the front of `pkts` and now belong to the transmit path. Frames
    /// that did not fit stay in `pkts`, still owned by the caller.
    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> usize;
}

/// Receive and transmit queue with the same index
pub struct QueuePair<RX, TX> {
    pub queue_id: u16,
    pub rx: RX,
    pub tx: TX,
}

/// A network port driven from the control plane
pub trait NetworkPort {
    type Rx: RxQueue + 'static;
    type Tx: TxQueue + 'static;

    /// Numeric port identifier
    fn id(&self) -> u32;

    fn name(&self) -> &str;

    fn state(&self) -> PortState;

    /// Check that the port refers to an existing, usable device
    fn validate(&mut self) -> Result<(), PortError>;

    fn capabilities(&self) -> Result<DeviceCapabilities, PortError>;

    fn configure(&mut self, conf: &PortConf) -> Result<(), PortError>;

    fn setup_rx_queue(
        &mut self,
        queue: u16,
        depth: u16,
        pool: &'static BufferPool,
    ) -> Result<(), PortError>;

    fn setup_tx_queue(&mut self, queue: u16, depth: u16) -> Result<(), PortError>;

    fn start(&mut self) -> Result<(), PortError>;

    fn stop(&mut self) -> Result<(), PortError>;

    fn close(&mut self) -> Result<(), PortError>;

    fn mac_address(&self) -> Result<EthernetAddress, PortError>;

    fn set_promiscuous(&mut self, enable: bool) -> Result<(), PortError>;

    /// Hand out the queue pairs of a started port, ordered by queue index.
    ///
    /// Can only succeed once.
    fn take_queue_pairs(&mut self) -> Result<Vec<QueuePair<Self::Rx, Self::Tx>>, PortError>;
}

/// Fail with `InvalidState` unless `actual` is one of `allowed`
pub(crate) fn expect_state(
    actual: PortState,
    allowed: &[PortState],
    expected: &'static str,
) -> Result<(), PortError> {
    if allowed.contains(&actual) {
        Ok(())
    } else {
        Err(PortError::InvalidState { expected, actual })
    }
}

/// Validate a requested queue count against a device maximum
pub(crate) fn check_queue_count(kind: &'static str, requested: u16, max: u16) -> Result<(), PortError> {
    if requested == 0 || requested > max {
        return Err(PortError::QueueCount {
            kind,
            requested,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desc_adjust_clamps_and_aligns() {
        let limits = DescLimits {
            min: 64,
            max: 4096,
            align: 32,
        };
        assert_eq!(limits.adjust(1024), 1024);
        assert_eq!(limits.adjust(1000), 1024);
        assert_eq!(limits.adjust(8), 64);
        assert_eq!(limits.adjust(10_000), 4096);
    }

    #[test]
    fn test_desc_adjust_unaligned_max() {
        let limits = DescLimits {
            min: 1,
            max: 1000,
            align: 64,
        };
        assert_eq!(limits.adjust(999), 960);
        assert_eq!(limits.adjust(1), 64);
    }

    #[test]
    fn test_check_queue_count() {
        assert!(check_queue_count("rx", 4, 8).is_ok());
        assert!(matches!(
            check_queue_count("rx", 9, 8),
            Err(PortError::QueueCount { requested: 9, max: 8, .. })
        ));
        assert!(check_queue_count("tx", 0, 8).is_err());
    }

    #[test]
    fn test_expect_state() {
        assert!(expect_state(PortState::Configured, &[PortState::Configured], "configured").is_ok());
        let err = expect_state(PortState::Started, &[PortState::Configured], "configured").unwrap_err();
        assert_eq!(err.to_string(), "port is started, operation needs it configured");
    }
}

//! Packet path: buffers, ports, flow distribution, and the echo loop

pub mod af_packet;
pub mod buffer;
pub mod ether;
pub mod forward;
pub mod port;
pub mod rss;

pub use af_packet::AfPacketPort;
pub use buffer::{BufferPool, PoolBuffer, PoolCache, PoolConfig, PoolError};
pub use forward::{BurstStats, Forwarder};
pub use port::{
    DescLimits, DeviceCapabilities, NetworkPort, PortConf, PortError, PortState, QueuePair,
    RxQueue, TxQueue,
};
pub use rss::{FlowDistributor, RssConf, RssHashFields};

//! Port bring-up
//!
//! Takes a port from "just a name" to started, promiscuous, with one queue
//! pair per core and a shared buffer pool behind the receive queues. Each
//! step either succeeds or ends the bring-up with its own error.

use std::mem;
use std::sync::Arc;

use smoltcp::wire::EthernetAddress;
use tracing::{info, warn};

use crate::config::EchoConfig;
use crate::dataplane::buffer::{BufferPool, PoolConfig, PoolError};
use crate::dataplane::forward::Forwarder;
use crate::dataplane::port::{NetworkPort, PortConf, PortState, QueuePair};
use crate::dataplane::rss::RssConf;
use crate::error::BringUpError;
use crate::lcore::{Launched, discover_lcores, launch_workers};

/// Read-only state every forwarding core sees
#[derive(Debug)]
pub struct DataplaneContext {
    pub port_id: u32,
    pub port_name: String,
    /// Device MAC, read once after start
    pub mac: EthernetAddress,
    pub burst_size: usize,
    pub pool: &'static BufferPool,
}

/// A started port with its queue pairs
///
/// Dropping it stops and closes the port.
pub struct Dataplane<P: NetworkPort> {
    pub ctx: Arc<DataplaneContext>,
    pub cores: Vec<usize>,
    pairs: Vec<QueuePair<P::Rx, P::Tx>>,
    port: P,
}

impl<P: NetworkPort> Dataplane<P> {
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Queue pairs, ordered by queue index. Empty once taken.
    pub fn take_queue_pairs(&mut self) -> Vec<QueuePair<P::Rx, P::Tx>> {
        mem::take(&mut self.pairs)
    }

    /// Start `body` on every core but the first; see [`launch_workers`]
    pub fn launch<F>(&mut self, body: F) -> Result<Launched<P::Rx, P::Tx>, BringUpError>
    where
        F: Fn(Forwarder<P::Rx, P::Tx>) + Clone + Send + 'static,
    {
        let pairs = self.take_queue_pairs();
        launch_workers(&self.ctx, pairs, &self.cores, body)
    }
}

impl<P: NetworkPort> Drop for Dataplane<P> {
    fn drop(&mut self) {
        if self.port.state() == PortState::Started
            && let Err(e) = self.port.stop()
        {
            warn!(port = %self.port.name(), error = %e, "Failed to stop port");
        }
        if let Err(e) = self.port.close() {
            warn!(port = %self.port.name(), error = %e, "Failed to close port");
        }
    }
}

/// Bring up `port` on the cores selected by `config`
pub fn initialize<P: NetworkPort>(
    port: P,
    config: &EchoConfig,
) -> Result<Dataplane<P>, BringUpError> {
    let cores = discover_lcores(config.cores.as_deref())?;
    info!(count = cores.len(), cores = ?cores, "Cores selected");
    initialize_on(port, config, cores)
}

/// Bring up `port` with one queue pair per entry of `cores`
pub fn initialize_on<P: NetworkPort>(
    mut port: P,
    config: &EchoConfig,
    cores: Vec<usize>,
) -> Result<Dataplane<P>, BringUpError> {
    if cores.is_empty() {
        return Err(BringUpError::NoCores);
    }
    let queues = u16::try_from(cores.len())
        .map_err(|_| BringUpError::Cores(format!("{} cores is too many", cores.len())))?;

    port.validate().map_err(|source| BringUpError::InvalidPort {
        port: config.port.clone(),
        source,
    })?;
    info!(port = %port.name(), id = port.id(), "Port validated");

    let buffers = config
        .mbufs_per_core
        .checked_mul(cores.len())
        .ok_or(BringUpError::PoolAlloc {
            buffers: usize::MAX,
            source: PoolError::InvalidCapacity {
                capacity: usize::MAX,
                max: u32::MAX as usize,
            },
        })?;
    let pool = BufferPool::create(PoolConfig {
        capacity: buffers,
        cache_size: config.cache_size,
        data_room: config.data_room,
    })
    .map_err(|source| BringUpError::PoolAlloc { buffers, source })?;

    let caps = port.capabilities().map_err(BringUpError::Configure)?;
    let fields = config.rss_fields.intersection(caps.rss_fields);
    if fields != config.rss_fields {
        warn!(
            requested = %config.rss_fields,
            effective = %fields,
            driver = caps.driver,
            "Device does not support all requested RSS hash fields"
        );
    }
    let conf = PortConf {
        rx_queues: queues,
        tx_queues: queues,
        rss: RssConf::new(fields),
    };
    port.configure(&conf).map_err(BringUpError::Configure)?;
    info!(queues, rss = %fields, driver = caps.driver, "Port configured");

    let rx_desc = caps.rx_desc.adjust(config.rx_desc);
    if rx_desc != config.rx_desc {
        info!(requested = config.rx_desc, adjusted = rx_desc, "rx descriptor count adjusted");
    }
    let tx_desc = caps.tx_desc.adjust(config.tx_desc);
    if tx_desc != config.tx_desc {
        info!(requested = config.tx_desc, adjusted = tx_desc, "tx descriptor count adjusted");
    }
    for queue in 0..queues {
        port.setup_rx_queue(queue, rx_desc, pool)
            .map_err(|source| BringUpError::RxQueueSetup { queue, source })?;
        port.setup_tx_queue(queue, tx_desc)
            .map_err(|source| BringUpError::TxQueueSetup { queue, source })?;
    }
    info!(queues, rx_desc, tx_desc, "Queues set up");

    port.start().map_err(BringUpError::Start)?;
    let mac = port.mac_address().map_err(BringUpError::MacAddress)?;
    port.set_promiscuous(true).map_err(BringUpError::Promiscuous)?;
    info!(port = %port.name(), mac = %mac, "Port started in promiscuous mode");

    let pairs = port.take_queue_pairs().map_err(BringUpError::Start)?;

    let ctx = Arc::new(DataplaneContext {
        port_id: port.id(),
        port_name: port.name().to_string(),
        mac,
        burst_size: config.burst_size,
        pool,
    });
    Ok(Dataplane {
        ctx,
        cores,
        pairs,
        port,
    })
}

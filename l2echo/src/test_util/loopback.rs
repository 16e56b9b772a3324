//! In-memory multi-queue port
//!
//! Behaves like a small multi-queue NIC without touching the kernel:
//! frames handed to [`LoopbackHandle::inject`] are spread over receive queues
//! with the same Toeplitz/RETA distribution a hardware port uses, and every
//! frame accepted for transmission is recorded per queue. Transmitted
//! buffers stay in flight until [`LoopbackHandle::complete_tx`] is called,
//! so a transmit ring can be filled up on purpose.
//!
//! Individual bring-up steps can be made to fail for error path tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use smoltcp::wire::EthernetAddress;

use crate::dataplane::buffer::{BufferPool, PoolBuffer, PoolCache};
use crate::dataplane::port::{
    DescLimits, DeviceCapabilities, NetworkPort, PortConf, PortError, PortState, QueuePair,
    RxQueue, TxQueue, check_queue_count, expect_state,
};
use crate::dataplane::rss::{FlowDistributor, RssHashFields};

/// MAC address of a loopback port unless overridden
pub const LOOPBACK_MAC: EthernetAddress = EthernetAddress([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct QueueShared {
    pending: Mutex<VecDeque<Vec<u8>>>,
    /// Every frame handed to the receive side, in order
    delivered: Mutex<Vec<Vec<u8>>>,
    /// Every frame accepted by the transmit side, in order
    transmitted: Mutex<Vec<Vec<u8>>>,
    in_flight: Mutex<Vec<PoolBuffer>>,
    tx_capacity: Mutex<usize>,
}

#[derive(Default)]
struct Shared {
    queues: Mutex<Vec<Arc<QueueShared>>>,
    distributor: Mutex<Option<FlowDistributor>>,
    promiscuous: Mutex<bool>,
}

impl Shared {
    fn queue(&self, queue: u16) -> Option<Arc<QueueShared>> {
        lock(&self.queues).get(queue as usize).cloned()
    }
}

/// Test side view of a [`LoopbackPort`]
///
/// Stays usable after the queue pairs have been moved to forwarding threads.
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
}

impl LoopbackHandle {
    /// Number of configured queues
    pub fn queues(&self) -> u16 {
        lock(&self.shared.queues).len() as u16
    }

    /// Hand a frame to the port as if it arrived on the wire.
    ///
    /// Returns the receive queue it was steered to, or `None` if the port
    /// has not been configured yet.
    pub fn inject(&self, frame: &[u8]) -> Option<u16> {
        let queue = lock(&self.shared.distributor)
            .as_ref()?
            .queue_for_frame(frame);
        self.inject_to(queue, frame)?;
        Some(queue)
    }

    /// Queue a frame on a specific receive queue, bypassing the distribution
    pub fn inject_to(&self, queue: u16, frame: &[u8]) -> Option<()> {
        let q = self.shared.queue(queue)?;
        lock(&q.pending).push_back(frame.to_vec());
        Some(())
    }

    /// Frames waiting to be received on `queue`
    pub fn pending(&self, queue: u16) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| lock(&q.pending).len())
    }

    /// Frames received on `queue` so far
    pub fn delivered(&self, queue: u16) -> Vec<Vec<u8>> {
        self.shared
            .queue(queue)
            .map_or_else(Vec::new, |q| lock(&q.delivered).clone())
    }

    /// Frames accepted for transmission on `queue` so far
    pub fn transmitted(&self, queue: u16) -> Vec<Vec<u8>> {
        self.shared
            .queue(queue)
            .map_or_else(Vec::new, |q| lock(&q.transmitted).clone())
    }

    pub fn transmitted_count(&self, queue: u16) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| lock(&q.transmitted).len())
    }

    /// Buffers currently held by the transmit ring of `queue`
    pub fn in_flight(&self, queue: u16) -> usize {
        self.shared
            .queue(queue)
            .map_or(0, |q| lock(&q.in_flight).len())
    }

    /// Limit how many buffers the transmit ring of `queue` holds
    pub fn set_tx_capacity(&self, queue: u16, capacity: usize) {
        if let Some(q) = self.shared.queue(queue) {
            *lock(&q.tx_capacity) = capacity;
        }
    }

    /// Finish transmission of everything in flight on `queue`, returning the
    /// buffers to the pool. Returns how many were completed.
    pub fn complete_tx(&self, queue: u16) -> usize {
        let Some(q) = self.shared.queue(queue) else {
            return 0;
        };
        let done: Vec<PoolBuffer> = lock(&q.in_flight).drain(..).collect();
        let n = done.len();
        for buf in done {
            buf.free();
        }
        n
    }

    pub fn is_promiscuous(&self) -> bool {
        *lock(&self.shared.promiscuous)
    }
}

/// Bring-up step to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fault {
    Missing,
    RxSetup(u16),
    TxSetup(u16),
    Start,
    MacAddress,
    Promiscuous,
}

/// A port backed by memory, for tests
pub struct LoopbackPort {
    id: u32,
    mac: EthernetAddress,
    max_queues: u16,
    rss_fields: RssHashFields,
    desc: DescLimits,
    faults: Vec<Fault>,
    state: PortState,
    conf: Option<PortConf>,
    rx_ready: Vec<Option<&'static BufferPool>>,
    tx_ready: Vec<bool>,
    taken: bool,
    shared: Arc<Shared>,
}

impl LoopbackPort {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            mac: LOOPBACK_MAC,
            max_queues: 16,
            rss_fields: RssHashFields::ALL,
            desc: DescLimits {
                min: 32,
                max: 4096,
                align: 32,
            },
            faults: Vec::new(),
            state: PortState::Unconfigured,
            conf: None,
            rx_ready: Vec::new(),
            tx_ready: Vec::new(),
            taken: false,
            shared: Arc::default(),
        }
    }

    pub fn with_mac(mut self, mac: EthernetAddress) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_max_queues(mut self, max_queues: u16) -> Self {
        self.max_queues = max_queues;
        self
    }

    /// Restrict the hash fields the port claims to support
    pub fn with_rss_fields(mut self, fields: RssHashFields) -> Self {
        self.rss_fields = fields;
        self
    }

    pub fn with_desc_limits(mut self, desc: DescLimits) -> Self {
        self.desc = desc;
        self
    }

    /// Behave like a port id that does not exist
    pub fn missing(mut self) -> Self {
        self.faults.push(Fault::Missing);
        self
    }

    pub fn fail_rx_setup(mut self, queue: u16) -> Self {
        self.faults.push(Fault::RxSetup(queue));
        self
    }

    pub fn fail_tx_setup(mut self, queue: u16) -> Self {
        self.faults.push(Fault::TxSetup(queue));
        self
    }

    pub fn fail_start(mut self) -> Self {
        self.faults.push(Fault::Start);
        self
    }

    pub fn fail_mac_address(mut self) -> Self {
        self.faults.push(Fault::MacAddress);
        self
    }

    pub fn fail_promiscuous(mut self) -> Self {
        self.faults.push(Fault::Promiscuous);
        self
    }

    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn faulty(&self, fault: Fault) -> bool {
        self.faults.contains(&fault)
    }

    fn injected(what: &str) -> PortError {
        PortError::Io(std::io::Error::other(format!("injected {what} failure")))
    }
}

impl NetworkPort for LoopbackPort {
    type Rx = LoopbackRx;
    type Tx = LoopbackTx;

    fn id(&self) -> u32 {
        self.id
    }

    fn name(&self) -> &str {
        "loopback"
    }

    fn state(&self) -> PortState {
        self.state
    }

    fn validate(&mut self) -> Result<(), PortError> {
        if self.faulty(Fault::Missing) {
            return Err(PortError::NotFound(self.id.to_string()));
        }
        Ok(())
    }

    fn capabilities(&self) -> Result<DeviceCapabilities, PortError> {
        Ok(DeviceCapabilities {
            driver: "loopback",
            max_rx_queues: self.max_queues,
            max_tx_queues: self.max_queues,
            rss_fields: self.rss_fields,
            rx_desc: self.desc,
            tx_desc: self.desc,
        })
    }

    fn configure(&mut self, conf: &PortConf) -> Result<(), PortError> {
        expect_state(
            self.state,
            &[PortState::Unconfigured, PortState::Configured, PortState::Stopped],
            "stopped or unconfigured",
        )?;
        check_queue_count("rx", conf.rx_queues, self.max_queues)?;
        check_queue_count("tx", conf.tx_queues, self.max_queues)?;
        if conf.rx_queues > 1 && conf.rss.fields.is_empty() {
            return Err(PortError::NoRssFields);
        }

        let queues = conf.rx_queues.max(conf.tx_queues) as usize;
        *lock(&self.shared.queues) = (0..queues).map(|_| Arc::default()).collect();
        *lock(&self.shared.distributor) = Some(FlowDistributor::new(conf.rss, conf.rx_queues));
        self.rx_ready = vec![None; conf.rx_queues as usize];
        self.tx_ready = vec![false; conf.tx_queues as usize];
        self.conf = Some(*conf);
        self.state = PortState::Configured;
        Ok(())
    }

    fn setup_rx_queue(
        &mut self,
        queue: u16,
        _depth: u16,
        pool: &'static BufferPool,
    ) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        if self.faulty(Fault::RxSetup(queue)) {
            return Err(Self::injected("rx queue setup"));
        }
        let configured = self.rx_ready.len() as u16;
        let slot = self
            .rx_ready
            .get_mut(queue as usize)
            .ok_or(PortError::InvalidQueue {
                kind: "rx",
                queue,
                configured,
            })?;
        *slot = Some(pool);
        Ok(())
    }

    fn setup_tx_queue(&mut self, queue: u16, depth: u16) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        if self.faulty(Fault::TxSetup(queue)) {
            return Err(Self::injected("tx queue setup"));
        }
        let configured = self.tx_ready.len() as u16;
        let slot = self
            .tx_ready
            .get_mut(queue as usize)
            .ok_or(PortError::InvalidQueue {
                kind: "tx",
                queue,
                configured,
            })?;
        *slot = true;
        if let Some(q) = self.shared.queue(queue) {
            *lock(&q.tx_capacity) = depth as usize;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Configured], "configured")?;
        if self.faulty(Fault::Start) {
            return Err(Self::injected("start"));
        }
        if let Some(queue) = self.rx_ready.iter().position(Option::is_none) {
            return Err(PortError::QueueNotSetUp {
                kind: "rx",
                queue: queue as u16,
            });
        }
        if let Some(queue) = self.tx_ready.iter().position(|ready| !ready) {
            return Err(PortError::QueueNotSetUp {
                kind: "tx",
                queue: queue as u16,
            });
        }
        self.state = PortState::Started;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PortError> {
        expect_state(self.state, &[PortState::Started], "started")?;
        self.state = PortState::Stopped;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PortError> {
        *lock(&self.shared.promiscuous) = false;
        self.state = PortState::Closed;
        Ok(())
    }

    fn mac_address(&self) -> Result<EthernetAddress, PortError> {
        if self.faulty(Fault::MacAddress) {
            return Err(Self::injected("MAC address read"));
        }
        Ok(self.mac)
    }

    fn set_promiscuous(&mut self, enable: bool) -> Result<(), PortError> {
        if self.faulty(Fault::Promiscuous) {
            return Err(Self::injected("promiscuous mode"));
        }
        *lock(&self.shared.promiscuous) = enable;
        Ok(())
    }

    fn take_queue_pairs(&mut self) -> Result<Vec<QueuePair<LoopbackRx, LoopbackTx>>, PortError> {
        expect_state(self.state, &[PortState::Started], "started")?;
        if self.taken {
            return Err(PortError::QueueNotSetUp { kind: "rx", queue: 0 });
        }
        self.taken = true;

        let mut pairs = Vec::with_capacity(self.rx_ready.len());
        for (queue, pool) in self.rx_ready.iter().enumerate() {
            let queue_id = queue as u16;
            let (Some(pool), Some(shared)) = (*pool, self.shared.queue(queue_id)) else {
                return Err(PortError::QueueNotSetUp {
                    kind: "rx",
                    queue: queue_id,
                });
            };
            pairs.push(QueuePair {
                queue_id,
                rx: LoopbackRx {
                    queue_id,
                    cache: PoolCache::new(pool),
                    shared: Arc::clone(&shared),
                },
                tx: LoopbackTx { queue_id, shared },
            });
        }
        Ok(pairs)
    }
}

/// Receive half of a loopback queue pair
pub struct LoopbackRx {
    queue_id: u16,
    cache: PoolCache,
    shared: Arc<QueueShared>,
}

impl RxQueue for LoopbackRx {
    fn queue_id(&self) -> u16 {
        self.queue_id
    }

    fn rx_burst(&mut self, pkts: &mut Vec<PoolBuffer>, max: usize) -> usize {
        let mut pending = lock(&self.shared.pending);
        let mut delivered = lock(&self.shared.delivered);
        let mut received = 0;
        while received < max {
            let Some(frame) = pending.pop_front() else {
                break;
            };
            let Some(mut buf) = self.cache.alloc() else {
                // Out of buffers: the frame stays on the ring
                pending.push_front(frame);
                break;
            };
            buf.fill(&frame);
            delivered.push(frame);
            pkts.push(buf);
            received += 1;
        }
        received
    }
}

/// Transmit half of a loopback queue pair
pub struct LoopbackTx {
    queue_id: u16,
    shared: Arc<QueueShared>,
}

impl TxQueue for LoopbackTx {
    fn queue_id(&self) -> u16 {
        self.queue_id
    }

    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> usize {
        let capacity = *lock(&self.shared.tx_capacity);
        let mut in_flight = lock(&self.shared.in_flight);
        let room = capacity.saturating_sub(in_flight.len());
        let accepted = room.min(pkts.len());

        let mut transmitted = lock(&self.shared.transmitted);
        for buf in pkts.drain(..accepted) {
            transmitted.push(buf.data().to_vec());
            in_flight.push(buf);
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::buffer::PoolConfig;
    use crate::dataplane::rss::RssConf;

    fn started(port: &mut LoopbackPort, queues: u16, pool: &'static BufferPool) {
        let conf = PortConf {
            rx_queues: queues,
            tx_queues: queues,
            rss: RssConf::default(),
        };
        port.configure(&conf).unwrap();
        for q in 0..queues {
            port.setup_rx_queue(q, 128, pool).unwrap();
            port.setup_tx_queue(q, 128).unwrap();
        }
        port.start().unwrap();
    }

    #[test]
    fn test_inject_before_configure() {
        let port = LoopbackPort::new(0);
        assert_eq!(port.handle().inject(&[0u8; 60]), None);
    }

    #[test]
    fn test_start_needs_all_queues() {
        let pool = BufferPool::create(PoolConfig::new(64, 0)).unwrap();
        let mut port = LoopbackPort::new(0);
        let conf = PortConf {
            rx_queues: 2,
            tx_queues: 2,
            rss: RssConf::default(),
        };
        port.configure(&conf).unwrap();
        port.setup_rx_queue(0, 128, pool).unwrap();
        port.setup_tx_queue(0, 128).unwrap();
        assert!(matches!(
            port.start(),
            Err(PortError::QueueNotSetUp { kind: "rx", queue: 1 })
        ));
    }

    #[test]
    fn test_rx_then_tx_ring_full() {
        let pool = BufferPool::create(PoolConfig::new(64, 0)).unwrap();
        let mut port = LoopbackPort::new(0);
        started(&mut port, 1, pool);
        let handle = port.handle();
        let mut pairs = port.take_queue_pairs().unwrap();
        let pair = &mut pairs[0];

        for i in 0..5u8 {
            handle.inject_to(0, &[i; 60]).unwrap();
        }
        handle.set_tx_capacity(0, 3);

        let mut pkts = Vec::new();
        assert_eq!(pair.rx.rx_burst(&mut pkts, 32), 5);
        assert_eq!(pool.available(), 59);

        assert_eq!(pair.tx.tx_burst(&mut pkts), 3);
        assert_eq!(pkts.len(), 2);
        assert_eq!(pkts[0].data()[0], 3);
        assert_eq!(handle.in_flight(0), 3);

        drop(pkts);
        assert_eq!(pool.available(), 61);
        assert_eq!(handle.complete_tx(0), 3);
        assert_eq!(pool.available(), 64);
        assert_eq!(handle.transmitted_count(0), 3);
    }

    #[test]
    fn test_rx_stops_when_pool_empty() {
        let pool = BufferPool::create(PoolConfig::new(4, 0)).unwrap();
        let mut port = LoopbackPort::new(0);
        started(&mut port, 1, pool);
        let handle = port.handle();
        let mut pairs = port.take_queue_pairs().unwrap();

        for _ in 0..6 {
            handle.inject_to(0, &[0u8; 60]).unwrap();
        }
        let mut pkts = Vec::new();
        assert_eq!(pairs[0].rx.rx_burst(&mut pkts, 32), 4);
        assert_eq!(handle.pending(0), 2);
    }

    #[test]
    fn test_queue_pairs_taken_once() {
        let pool = BufferPool::create(PoolConfig::new(64, 0)).unwrap();
        let mut port = LoopbackPort::new(0);
        started(&mut port, 2, pool);
        assert_eq!(port.take_queue_pairs().unwrap().len(), 2);
        assert!(port.take_queue_pairs().is_err());
    }
}

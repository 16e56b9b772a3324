//! Per-core echo loop
//!
//! One [`Forwarder`] owns one queue pair and runs it to completion:
//! receive a burst, mirror every frame, hand the burst to the transmit
//! queue, and return whatever the transmit queue did not take to the pool.
//! Nothing here locks or blocks, and no state is shared with other cores
//! apart from the buffer pool's lock-free free list.

use smoltcp::wire::EthernetAddress;
use tracing::info;

use super::buffer::PoolBuffer;
use super::ether::mirror;
use super::port::{QueuePair, RxQueue, TxQueue};

/// Outcome of one poll iteration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstStats {
    pub received: usize,
    pub transmitted: usize,
    /// Frames the transmit queue refused, freed back to the pool
    pub reclaimed: usize,
}

impl BurstStats {
    pub fn is_idle(&self) -> bool {
        self.received == 0
    }
}

/// Echo loop state of one core
pub struct Forwarder<RX, TX> {
    lcore: usize,
    queue_id: u16,
    rx: RX,
    tx: TX,
    device_mac: EthernetAddress,
    burst_size: usize,
    /// Burst scratch space, allocated once
    pkts: Vec<PoolBuffer>,
}

impl<RX: RxQueue, TX: TxQueue> Forwarder<RX, TX> {
    pub fn new(
        lcore: usize,
        pair: QueuePair<RX, TX>,
        device_mac: EthernetAddress,
        burst_size: usize,
    ) -> Self {
        let burst_size = burst_size.max(1);
        Self {
            lcore,
            queue_id: pair.queue_id,
            rx: pair.rx,
            tx: pair.tx,
            device_mac,
            burst_size,
            pkts: Vec::with_capacity(burst_size),
        }
    }

    pub fn lcore(&self) -> usize {
        self.lcore
    }

    pub fn queue_id(&self) -> u16 {
        self.queue_id
    }

    /// Poll the queue pair once.
    ///
    /// Every received buffer leaves this call either accepted by the transmit
    /// queue or back in the pool.
    pub fn poll_once(&mut self) -> BurstStats {
        let received = self.rx.rx_burst(&mut self.pkts, self.burst_size);
        if received == 0 {
            return BurstStats::default();
        }

        for pkt in self.pkts.iter_mut() {
            mirror(pkt.data_mut(), self.device_mac);
        }

        let transmitted = self.tx.tx_burst(&mut self.pkts);

        let reclaimed = self.pkts.len();
        for pkt in self.pkts.drain(..) {
            pkt.free();
        }

        debug_assert_eq!(transmitted + reclaimed, received);
        BurstStats {
            received,
            transmitted,
            reclaimed,
        }
    }

    /// Busy-poll forever
    pub fn run(mut self) -> ! {
        info!(
            lcore = self.lcore,
            queue = self.queue_id,
            burst = self.burst_size,
            "Forwarding loop started"
        );
        loop {
            self.poll_once();
        }
    }

    /// Poll `iterations` times and sum up the results
    pub fn run_for(&mut self, iterations: usize) -> BurstStats {
        let mut total = BurstStats::default();
        for _ in 0..iterations {
            let stats = self.poll_once();
            total.received += stats.received;
            total.transmitted += stats.transmitted;
            total.reclaimed += stats.reclaimed;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::buffer::{BufferPool, PoolConfig};
    use crate::dataplane::port::{NetworkPort, PortConf};
    use crate::dataplane::rss::RssConf;
    use crate::test_util::loopback::{LOOPBACK_MAC, LoopbackHandle, LoopbackPort, LoopbackRx, LoopbackTx};
    use crate::test_util::packets::{OTHER_MAC, PEER_MAC, build_ethernet_frame};
    use smoltcp::wire::EthernetProtocol;

    fn single_queue(
        pool: &'static BufferPool,
        burst: usize,
    ) -> (Forwarder<LoopbackRx, LoopbackTx>, LoopbackHandle) {
        let mut port = LoopbackPort::new(0);
        let conf = PortConf {
            rx_queues: 1,
            tx_queues: 1,
            rss: RssConf::default(),
        };
        port.configure(&conf).unwrap();
        port.setup_rx_queue(0, 1024, pool).unwrap();
        port.setup_tx_queue(0, 1024).unwrap();
        port.start().unwrap();
        let handle = port.handle();
        let pair = port.take_queue_pairs().unwrap().remove(0);
        (Forwarder::new(0, pair, LOOPBACK_MAC, burst), handle)
    }

    fn frame(seq: u8) -> Vec<u8> {
        build_ethernet_frame(OTHER_MAC, PEER_MAC, EthernetProtocol::Ipv4, &[seq; 46])
    }

    #[test]
    fn test_empty_poll_is_noop() {
        let pool = BufferPool::create(PoolConfig::new(64, 0)).unwrap();
        let (mut fwd, handle) = single_queue(pool, 32);

        assert_eq!(fwd.poll_once(), BurstStats::default());
        assert_eq!(handle.transmitted_count(0), 0);
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn test_burst_is_mirrored_and_sent() {
        let pool = BufferPool::create(PoolConfig::new(64, 0)).unwrap();
        let (mut fwd, handle) = single_queue(pool, 32);

        for seq in 0..4 {
            handle.inject_to(0, &frame(seq)).unwrap();
        }
        let stats = fwd.poll_once();
        assert_eq!(
            stats,
            BurstStats {
                received: 4,
                transmitted: 4,
                reclaimed: 0
            }
        );

        let sent = handle.transmitted(0);
        for (seq, f) in sent.iter().enumerate() {
            assert_eq!(&f[0..6], &PEER_MAC);
            assert_eq!(&f[6..12], &LOOPBACK_MAC.0);
            assert_eq!(&f[12..], &frame(seq as u8)[12..]);
        }
    }

    #[test]
    fn test_partial_tx_reclaims_rest() {
        let pool = BufferPool::create(PoolConfig::new(128, 0)).unwrap();
        let (mut fwd, handle) = single_queue(pool, 32);
        handle.set_tx_capacity(0, 20);

        for seq in 0..32 {
            handle.inject_to(0, &frame(seq)).unwrap();
        }
        let before = pool.available();

        let stats = fwd.poll_once();
        assert_eq!(stats.received, 32);
        assert_eq!(stats.transmitted, 20);
        assert_eq!(stats.reclaimed, 12);

        // 20 buffers sit on the tx ring, the 12 refused ones are back
        assert_eq!(pool.available(), before - 20);
        assert_eq!(handle.in_flight(0), 20);

        // The accepted 20 are the first 20 received, mirrored, in order
        let sent = handle.transmitted(0);
        assert_eq!(sent.len(), 20);
        for (seq, f) in sent.iter().enumerate() {
            assert_eq!(&f[0..6], &PEER_MAC);
            assert_eq!(&f[6..12], &LOOPBACK_MAC.0);
            assert_eq!(&f[12..], &frame(seq as u8)[12..]);
        }

        handle.complete_tx(0);
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn test_burst_limit() {
        let pool = BufferPool::create(PoolConfig::new(128, 0)).unwrap();
        let (mut fwd, handle) = single_queue(pool, 8);

        for seq in 0..20 {
            handle.inject_to(0, &frame(seq)).unwrap();
        }
        assert_eq!(fwd.poll_once().received, 8);
        assert_eq!(handle.pending(0), 12);

        let total = fwd.run_for(5);
        assert_eq!(total.received, 12);
        assert_eq!(handle.transmitted_count(0), 20);
    }

    #[test]
    fn test_runt_frames_forwarded_unmodified() {
        let pool = BufferPool::create(PoolConfig::new(16, 0)).unwrap();
        let (mut fwd, handle) = single_queue(pool, 32);

        handle.inject_to(0, &[0xaa; 10]).unwrap();
        assert_eq!(fwd.poll_once().transmitted, 1);
        assert_eq!(handle.transmitted(0)[0], vec![0xaa; 10]);
    }
}

use std::net::Ipv4Addr;

use l2echo::config::EchoConfig;
use l2echo::dataplane::Forwarder;
use l2echo::error::BringUpError;
use l2echo::initialize_on;
use l2echo::lcore::affinity_cores;
use l2echo::test_util::loopback::{LOOPBACK_MAC, LoopbackRx, LoopbackTx};
use l2echo::test_util::packets::PEER_MAC;
use l2echo::test_util::{FlowSpec, LoopbackPort, build_ipv4_frame};

const QUEUES: u16 = 4;

fn config() -> EchoConfig {
    EchoConfig::new("0").mbufs_per_core(512).cache_size(0)
}

fn forwarders(port: LoopbackPort, cores: Vec<usize>) -> Vec<Forwarder<LoopbackRx, LoopbackTx>> {
    let mut dp = initialize_on(port, &config(), cores).expect("bring-up");
    let mac = dp.ctx.mac;
    let burst = dp.ctx.burst_size;
    dp.take_queue_pairs()
        .into_iter()
        .map(|pair| Forwarder::new(pair.queue_id as usize, pair, mac, burst))
        .collect()
}

fn flow(n: u16) -> FlowSpec {
    FlowSpec::tcp(
        Ipv4Addr::new(10, 0, 0, 1),
        10_000 + n,
        Ipv4Addr::new(10, 0, 1, 1),
        443,
    )
}

#[test]
fn test_flow_sticks_to_one_queue() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = LoopbackPort::new(0);
    let handle = port.handle();
    let mut fwds = forwarders(port, (0..QUEUES as usize).collect());

    let frame = build_ipv4_frame(&flow(1), b"sticky");
    let mut home = None;

    for _ in 0..1000 {
        for _ in 0..32 {
            let q = handle.inject(&frame).unwrap();
            assert_eq!(*home.get_or_insert(q), q);
        }

        for fwd in fwds.iter_mut() {
            let stats = fwd.poll_once();
            if Some(fwd.queue_id()) == home {
                assert_eq!(stats.received, 32);
                assert_eq!(stats.transmitted, 32);
            } else {
                assert!(stats.is_idle());
            }
            handle.complete_tx(fwd.queue_id());
        }
    }

    let home = home.unwrap();
    for q in 0..QUEUES {
        let expected = if q == home { 32_000 } else { 0 };
        assert_eq!(handle.transmitted_count(q), expected);
    }
}

#[test]
fn test_frames_echoed_on_their_own_queue() {
    let _ = tracing_subscriber::fmt::try_init();

    let port = LoopbackPort::new(0);
    let handle = port.handle();
    let mut fwds = forwarders(port, (0..QUEUES as usize).collect());

    for n in 0..64 {
        handle.inject(&build_ipv4_frame(&flow(n), &n.to_be_bytes())).unwrap();
    }
    for fwd in fwds.iter_mut() {
        while fwd.poll_once().received > 0 {}
    }

    let mut used_queues = 0;
    let mut total = 0;
    for q in 0..QUEUES {
        let delivered = handle.delivered(q);
        let transmitted = handle.transmitted(q);
        assert_eq!(delivered.len(), transmitted.len());
        if !delivered.is_empty() {
            used_queues += 1;
        }
        total += transmitted.len();

        for (rx, tx) in delivered.iter().zip(&transmitted) {
            assert_eq!(&tx[0..6], &PEER_MAC);
            assert_eq!(&tx[6..12], &LOOPBACK_MAC.0);
            assert_eq!(&tx[12..], &rx[12..]);
        }
    }
    assert_eq!(total, 64);
    assert!(used_queues > 1, "64 flows all hashed to one queue");
}

#[test]
fn test_buffers_return_after_transmit() {
    let port = LoopbackPort::new(0);
    let handle = port.handle();
    let mut dp = initialize_on(port, &config(), vec![0, 1]).expect("bring-up");
    let pool = dp.ctx.pool;
    let (mac, burst) = (dp.ctx.mac, dp.ctx.burst_size);
    let mut fwds: Vec<_> = dp
        .take_queue_pairs()
        .into_iter()
        .map(|pair| Forwarder::new(0, pair, mac, burst))
        .collect();

    for n in 0..100 {
        handle.inject(&build_ipv4_frame(&flow(n), b"")).unwrap();
    }
    for fwd in fwds.iter_mut() {
        fwd.run_for(10);
    }
    assert_eq!(pool.available(), pool.capacity() - 100);

    handle.complete_tx(0);
    handle.complete_tx(1);
    assert_eq!(pool.available(), pool.capacity());
}

#[test]
fn test_threads_forward_in_parallel() {
    let _ = tracing_subscriber::fmt::try_init();

    let cores: Vec<usize> = affinity_cores().unwrap().into_iter().take(4).collect();
    let queues = cores.len() as u16;

    let port = LoopbackPort::new(0);
    let handle = port.handle();
    let mut dp = initialize_on(port, &config(), cores).expect("bring-up");

    for n in 0..400 {
        handle.inject(&build_ipv4_frame(&flow(n), b"parallel")).unwrap();
    }

    let worker_handle = handle.clone();
    let launched = dp
        .launch(move |mut fwd| {
            while worker_handle.pending(fwd.queue_id()) > 0 {
                fwd.poll_once();
            }
        })
        .expect("launch");
    assert_eq!(launched.workers.len(), queues as usize - 1);

    let mut local = launched.local;
    while handle.pending(local.queue_id()) > 0 {
        local.poll_once();
    }
    for worker in launched.workers {
        worker.join().expect("worker panicked");
    }

    let mut total = 0;
    for q in 0..queues {
        assert_eq!(handle.transmitted_count(q), handle.delivered(q).len());
        total += handle.transmitted_count(q);
    }
    assert_eq!(total, 400);
}

#[test]
fn test_launch_fails_on_unusable_core() {
    let first = affinity_cores().unwrap()[0];
    let mut dp = initialize_on(LoopbackPort::new(0), &config(), vec![first, 100_000])
        .expect("bring-up");

    let err = dp.launch(|_| {}).err().expect("launch must fail");
    assert!(matches!(err, BringUpError::Launch { lcore: 100_000, .. }));
}

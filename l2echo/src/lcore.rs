//! Logical cores: discovery, pinning, and launching the forwarding loops
//!
//! Queue pair `i` runs on the `i`-th selected core. Pair 0 stays on the
//! calling thread; every other pair gets its own pinned OS thread.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::bringup::DataplaneContext;
use crate::dataplane::forward::Forwarder;
use crate::dataplane::port::{QueuePair, RxQueue, TxQueue};
use crate::error::BringUpError;

/// CPUs the calling thread may run on
pub fn affinity_cores() -> nix::Result<Vec<usize>> {
    let set = sched_getaffinity(Pid::from_raw(0))?;
    Ok((0..CpuSet::count())
        .filter(|&cpu| set.is_set(cpu).unwrap_or(false))
        .collect())
}

/// Pick the cores to forward on.
///
/// Without a request this is the whole affinity mask; a requested list must
/// be a subset of it.
pub fn discover_lcores(requested: Option<&[usize]>) -> Result<Vec<usize>, BringUpError> {
    let allowed = affinity_cores().map_err(|e| BringUpError::Cores(e.to_string()))?;

    let cores = match requested {
        None => allowed,
        Some(requested) => {
            if let Some(cpu) = requested.iter().find(|cpu| !allowed.contains(cpu)) {
                return Err(BringUpError::Cores(format!(
                    "core {cpu} is not in the affinity mask {allowed:?}"
                )));
            }
            requested.to_vec()
        }
    };

    if cores.is_empty() {
        return Err(BringUpError::NoCores);
    }
    if cores.len() > u16::MAX as usize {
        return Err(BringUpError::Cores(format!("{} cores is too many", cores.len())));
    }
    Ok(cores)
}

/// Pin the calling thread to one CPU
pub fn pin_to_cpu(cpu: usize) -> nix::Result<()> {
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)
}

/// Forwarding loops after launch
pub struct Launched<RX, TX> {
    /// Core the caller is expected to run `local` on
    pub local_lcore: usize,
    pub local: Forwarder<RX, TX>,
    pub workers: Vec<JoinHandle<()>>,
}

/// Start a pinned worker thread running `body` for every queue pair but the
/// first, which is returned for the caller to run.
///
/// Returns once every worker has reported that it is pinned. A worker that
/// could not be pinned makes the whole launch fail.
pub fn launch_workers<RX, TX, F>(
    ctx: &Arc<DataplaneContext>,
    pairs: Vec<QueuePair<RX, TX>>,
    cores: &[usize],
    body: F,
) -> Result<Launched<RX, TX>, BringUpError>
where
    RX: RxQueue + 'static,
    TX: TxQueue + 'static,
    F: Fn(Forwarder<RX, TX>) + Clone + Send + 'static,
{
    if pairs.is_empty() || pairs.len() != cores.len() {
        return Err(BringUpError::Launch {
            lcore: cores.first().copied().unwrap_or(0),
            source: io::Error::other(format!(
                "{} queue pairs for {} cores",
                pairs.len(),
                cores.len()
            )),
        });
    }

    let remote = pairs.len() - 1;
    let (ack_tx, ack_rx) = crossbeam_channel::bounded::<(usize, nix::Result<()>)>(remote);
    let mut local = None;
    let mut workers = Vec::with_capacity(remote);

    for (pair, &lcore) in pairs.into_iter().zip(cores) {
        let fwd = Forwarder::new(lcore, pair, ctx.mac, ctx.burst_size);
        if local.is_none() {
            local = Some(fwd);
            continue;
        }

        let ack = ack_tx.clone();
        let body = body.clone();
        let handle = thread::Builder::new()
            .name(format!("lcore-{lcore}"))
            .spawn(move || {
                let pinned = pin_to_cpu(lcore);
                let ok = pinned.is_ok();
                let _ = ack.send((lcore, pinned));
                drop(ack);
                if ok {
                    body(fwd);
                }
            })
            .map_err(|source| BringUpError::Launch { lcore, source })?;
        debug!(lcore, "Worker spawned");
        workers.push(handle);
    }
    drop(ack_tx);

    for _ in 0..remote {
        match ack_rx.recv() {
            Ok((_, Ok(()))) => {}
            Ok((lcore, Err(e))) => {
                return Err(BringUpError::Launch {
                    lcore,
                    source: io::Error::from(e),
                });
            }
            Err(_) => {
                return Err(BringUpError::Launch {
                    lcore: cores[0],
                    source: io::Error::other("worker exited before reporting"),
                });
            }
        }
    }

    let local = local.ok_or(BringUpError::NoCores)?;
    info!(local = cores[0], remote, "Forwarding loops launched");
    Ok(Launched {
        local_lcore: cores[0],
        local,
        workers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_not_empty() {
        let cores = affinity_cores().unwrap();
        assert!(!cores.is_empty());
    }

    #[test]
    fn test_discover_all() {
        assert_eq!(discover_lcores(None).unwrap(), affinity_cores().unwrap());
    }

    #[test]
    fn test_discover_subset() {
        let first = affinity_cores().unwrap()[0];
        assert_eq!(discover_lcores(Some(&[first])).unwrap(), vec![first]);
    }

    #[test]
    fn test_discover_outside_mask() {
        assert!(matches!(
            discover_lcores(Some(&[100_000])),
            Err(BringUpError::Cores(_))
        ));
    }

    #[test]
    fn test_discover_empty_request() {
        assert!(matches!(discover_lcores(Some(&[])), Err(BringUpError::NoCores)));
    }

    #[test]
    fn test_pin_invalid_cpu() {
        assert!(pin_to_cpu(CpuSet::count()).is_err());
    }
}

use std::io;

use thiserror::Error;

use crate::dataplane::buffer::PoolError;
use crate::dataplane::port::PortError;

/// Bring-up failures, one per step. All of them are fatal.
#[derive(Debug, Error)]
pub enum BringUpError {
    #[error("no usable cores")]
    NoCores,

    #[error("core selection failed: {0}")]
    Cores(String),

    #[error("invalid port '{port}': {source}")]
    InvalidPort {
        port: String,
        #[source]
        source: PortError,
    },

    #[error("cannot create buffer pool of {buffers} buffers: {source}")]
    PoolAlloc {
        buffers: usize,
        #[source]
        source: PoolError,
    },

    #[error("cannot configure port: {0}")]
    Configure(#[source] PortError),

    #[error("cannot set up rx queue {queue}: {source}")]
    RxQueueSetup {
        queue: u16,
        #[source]
        source: PortError,
    },

    #[error("cannot set up tx queue {queue}: {source}")]
    TxQueueSetup {
        queue: u16,
        #[source]
        source: PortError,
    },

    #[error("cannot start port: {0}")]
    Start(#[source] PortError),

    #[error("cannot read port MAC address: {0}")]
    MacAddress(#[source] PortError),

    #[error("cannot enable promiscuous mode: {0}")]
    Promiscuous(#[source] PortError),

    #[error("cannot launch forwarding loop on lcore {lcore}: {source}")]
    Launch {
        lcore: usize,
        #[source]
        source: io::Error,
    },
}

impl BringUpError {
    /// Name of the failed step
    pub fn step(&self) -> &'static str {
        match self {
            BringUpError::NoCores | BringUpError::Cores(_) => "discover cores",
            BringUpError::InvalidPort { .. } => "validate port",
            BringUpError::PoolAlloc { .. } => "allocate buffer pool",
            BringUpError::Configure(_) => "configure port",
            BringUpError::RxQueueSetup { .. } => "set up rx queue",
            BringUpError::TxQueueSetup { .. } => "set up tx queue",
            BringUpError::Start(_) => "start port",
            BringUpError::MacAddress(_) => "read MAC address",
            BringUpError::Promiscuous(_) => "enable promiscuous mode",
            BringUpError::Launch { .. } => "launch",
        }
    }

    /// OS error number behind the failure, if there is one
    pub fn errno(&self) -> Option<i32> {
        use std::error::Error;

        let mut source = self.source();
        while let Some(err) = source {
            // PortError::Io is transparent and hides the io::Error from the chain
            let io = match err.downcast_ref::<PortError>() {
                Some(PortError::Io(io)) => Some(io),
                _ => err.downcast_ref::<io::Error>(),
            };
            if let Some(code) = io.and_then(io::Error::raw_os_error) {
                return Some(code);
            }
            if let Some(nix) = err.downcast_ref::<nix::Error>() {
                return Some(*nix as i32);
            }
            source = err.source();
        }
        None
    }
}

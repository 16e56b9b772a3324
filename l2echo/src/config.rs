//! Runtime configuration of the echo forwarder

use thiserror::Error;

use crate::dataplane::buffer::{DEFAULT_DATA_ROOM, MAX_CACHE_SIZE};
use crate::dataplane::rss::RssHashFields;

pub const DEFAULT_BURST_SIZE: usize = 32;
pub const MAX_BURST_SIZE: usize = 512;
pub const DEFAULT_RX_DESC: u16 = 1024;
pub const DEFAULT_TX_DESC: u16 = 1024;
/// 2^13 - 1, a power of two minus one keeps the mempool ring optimal
pub const DEFAULT_MBUFS_PER_CORE: usize = 8191;
pub const DEFAULT_CACHE_SIZE: usize = 250;

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port must be given")]
    MissingPort,

    #[error("burst size must be between 1 and {max}, got {0}", max = MAX_BURST_SIZE)]
    BurstSize(usize),

    #[error("{0} descriptor count must not be zero")]
    ZeroDescriptors(&'static str),

    #[error("per-core buffer count must not be zero")]
    ZeroBuffers,

    #[error("cache size {cache_size} exceeds {max}", max = MAX_CACHE_SIZE)]
    CacheSize { cache_size: usize },

    #[error("RSS hash fields must not be empty with {cores} cores")]
    NoRssFields { cores: usize },

    #[error("invalid core list '{list}': {reason}")]
    CoreList { list: String, reason: String },
}

/// Echo forwarder configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoConfig {
    /// Interface name or index
    pub port: String,
    /// Explicit core list; the affinity mask when `None`
    pub cores: Option<Vec<usize>>,
    pub burst_size: usize,
    pub rx_desc: u16,
    pub tx_desc: u16,
    pub mbufs_per_core: usize,
    pub cache_size: usize,
    pub data_room: usize,
    pub rss_fields: RssHashFields,
}

impl EchoConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            cores: None,
            burst_size: DEFAULT_BURST_SIZE,
            rx_desc: DEFAULT_RX_DESC,
            tx_desc: DEFAULT_TX_DESC,
            mbufs_per_core: DEFAULT_MBUFS_PER_CORE,
            cache_size: DEFAULT_CACHE_SIZE,
            data_room: DEFAULT_DATA_ROOM,
            rss_fields: RssHashFields::ALL,
        }
    }

    pub fn cores(mut self, cores: Option<Vec<usize>>) -> Self {
        self.cores = cores;
        self
    }

    pub fn burst_size(mut self, burst_size: usize) -> Self {
        self.burst_size = burst_size;
        self
    }

    pub fn rx_desc(mut self, rx_desc: u16) -> Self {
        self.rx_desc = rx_desc;
        self
    }

    pub fn tx_desc(mut self, tx_desc: u16) -> Self {
        self.tx_desc = tx_desc;
        self
    }

    pub fn mbufs_per_core(mut self, mbufs_per_core: usize) -> Self {
        self.mbufs_per_core = mbufs_per_core;
        self
    }

    pub fn cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn data_room(mut self, data_room: usize) -> Self {
        self.data_room = data_room;
        self
    }

    pub fn rss_fields(mut self, rss_fields: RssHashFields) -> Self {
        self.rss_fields = rss_fields;
        self
    }

    /// Check everything that can be checked without touching the system
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port.is_empty() {
            return Err(ConfigError::MissingPort);
        }
        if self.burst_size == 0 || self.burst_size > MAX_BURST_SIZE {
            return Err(ConfigError::BurstSize(self.burst_size));
        }
        if self.rx_desc == 0 {
            return Err(ConfigError::ZeroDescriptors("rx"));
        }
        if self.tx_desc == 0 {
            return Err(ConfigError::ZeroDescriptors("tx"));
        }
        if self.mbufs_per_core == 0 {
            return Err(ConfigError::ZeroBuffers);
        }
        if self.cache_size > MAX_CACHE_SIZE {
            return Err(ConfigError::CacheSize {
                cache_size: self.cache_size,
            });
        }
        if let Some(cores) = &self.cores
            && cores.len() > 1
            && self.rss_fields.is_empty()
        {
            return Err(ConfigError::NoRssFields { cores: cores.len() });
        }
        Ok(())
    }
}

/// Parse a core list such as `0-3,6` into sorted, unique core ids
pub fn parse_core_list(list: &str) -> Result<Vec<usize>, ConfigError> {
    let invalid = |reason: &str| ConfigError::CoreList {
        list: list.to_string(),
        reason: reason.to_string(),
    };
    let number = |s: &str| {
        s.trim()
            .parse::<usize>()
            .map_err(|_| invalid(&format!("'{}' is not a core number", s.trim())))
    };

    let mut cores = Vec::new();
    for part in list.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(invalid("empty element"));
        }
        match part.split_once('-') {
            Some((first, last)) => {
                let (first, last) = (number(first)?, number(last)?);
                if first > last {
                    return Err(invalid(&format!("range {first}-{last} is reversed")));
                }
                cores.extend(first..=last);
            }
            None => cores.push(number(part)?),
        }
    }
    cores.sort_unstable();
    cores.dedup();
    Ok(cores)
}

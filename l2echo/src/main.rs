use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use l2echo::config::{
    DEFAULT_BURST_SIZE, DEFAULT_CACHE_SIZE, DEFAULT_MBUFS_PER_CORE, DEFAULT_RX_DESC,
    DEFAULT_TX_DESC, EchoConfig, parse_core_list,
};
use l2echo::dataplane::{AfPacketPort, RssHashFields};
use l2echo::error::BringUpError;
use l2echo::lcore::pin_to_cpu;

#[derive(Parser)]
#[command(name = "l2echo")]
#[command(about = "Multi-core L2 echo forwarder")]
struct Args {
    /// Interface name or index
    #[arg(short, long)]
    port: String,

    /// Cores to forward on, e.g. 0-3,6 (default: affinity mask)
    #[arg(short = 'l', long)]
    cores: Option<String>,

    /// Frames per burst
    #[arg(long, default_value_t = DEFAULT_BURST_SIZE)]
    burst: usize,

    /// rx ring depth
    #[arg(long, default_value_t = DEFAULT_RX_DESC)]
    rx_desc: u16,

    /// tx ring depth
    #[arg(long, default_value_t = DEFAULT_TX_DESC)]
    tx_desc: u16,

    /// Buffers per core
    #[arg(long, default_value_t = DEFAULT_MBUFS_PER_CORE)]
    mbufs_per_core: usize,

    /// Per-core buffer cache
    #[arg(long, default_value_t = DEFAULT_CACHE_SIZE)]
    cache_size: usize,

    /// RSS hash fields (ip, tcp, udp, all, none)
    #[arg(long, default_value = "ip,tcp,udp")]
    rss: RssHashFields,
}

impl Args {
    fn into_config(self) -> anyhow::Result<EchoConfig> {
        let cores = self
            .cores
            .as_deref()
            .map(parse_core_list)
            .transpose()
            .context("Invalid --cores")?;

        let config = EchoConfig::new(self.port)
            .cores(cores)
            .burst_size(self.burst)
            .rx_desc(self.rx_desc)
            .tx_desc(self.tx_desc)
            .mbufs_per_core(self.mbufs_per_core)
            .cache_size(self.cache_size)
            .rss_fields(self.rss);
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("l2echo=info".parse()?))
        .init();

    let config = Args::parse().into_config()?;
    info!(port = %config.port, burst = config.burst_size, "Starting l2echo");

    if let Err(e) = run(config) {
        error!(step = e.step(), errno = ?e.errno(), error = %e, "Bring-up failed");
        std::process::exit(1);
    }
    Ok(())
}

/// Bring up the port and forward until the process is killed
fn run(config: EchoConfig) -> Result<(), BringUpError> {
    let port = AfPacketPort::new(config.port.clone());
    let mut dataplane = l2echo::initialize(port, &config)?;

    let launched = dataplane.launch(|fwd| fwd.run())?;
    pin_to_cpu(launched.local_lcore).map_err(|e| BringUpError::Launch {
        lcore: launched.local_lcore,
        source: e.into(),
    })?;

    launched.local.run()
}

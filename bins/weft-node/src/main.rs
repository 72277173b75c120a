//! Weft network node binary.
//!
//! Runs the network worker over libp2p on top of an in-memory chain. With
//! `--dev-blocks N` the node starts with N blocks of a built-in development
//! chain, so a handful of local nodes can be pointed at each other to
//! exercise discovery, warp sync and block download.

mod settings;

use anyhow::Context;
use clap::Parser;
use settings::{LogFormat, NodeSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use weft_core::crypto::AuthorityKey;
use weft_core::{BlockFactory, ChainBackend, MemoryChain, SessionInfoProvider, StaticSessionProvider};
use weft_network::{NetworkNode, NetworkService};

/// How often the node logs a one-line status.
const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Justification period of the development chain.
const DEV_FINALITY_PERIOD: u64 = 8;

/// Weft network node.
#[derive(Parser, Debug)]
#[command(name = "weft-node", version, about = "Weft P2P network node")]
struct Args {
    /// Settings file [default: <data-dir>/weft.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the node key and the default settings file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// P2P listen address
    #[arg(long)]
    listen_addr: Option<String>,

    /// P2P listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Reserved peers as `<multiaddr>/p2p/<peer id>` (comma-separated)
    #[arg(long, value_delimiter = ',')]
    reserved_peers: Vec<String>,

    /// Only connect to reserved peers
    #[arg(long)]
    reserved_only: bool,

    /// Disable mDNS discovery
    #[arg(long)]
    no_mdns: bool,

    /// Start in warp sync
    #[arg(long)]
    warp_sync: bool,

    /// Blocks of the development chain to produce at startup
    #[arg(long)]
    dev_blocks: Option<u64>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Args {
    /// Load the layered settings and apply flags on top.
    fn into_settings(self) -> anyhow::Result<NodeSettings> {
        let mut settings = NodeSettings::load(self.config.as_deref(), self.data_dir.as_deref())?;
        if let Some(data_dir) = self.data_dir {
            settings.data_dir = data_dir;
        }
        if let Some(level) = self.log_level {
            settings.log_level = level;
        }
        if let Some(format) = self.log_format {
            settings.log_format = format;
        }
        if let Some(blocks) = self.dev_blocks {
            settings.dev_blocks = blocks;
        }

        let network = &mut settings.network;
        if let Some(addr) = self.listen_addr {
            network.listen_addr = addr;
        }
        if let Some(port) = self.listen_port {
            network.listen_port = port;
        }
        network.reserved_peers.extend(self.reserved_peers);
        network.reserved_only |= self.reserved_only;
        network.sync.warp_sync |= self.warp_sync;
        if self.no_mdns {
            network.enable_mdns = false;
        }
        settings.network.node_key_path = Some(settings.node_key_path());
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Args::parse().into_settings()?;
    init_logging(&settings.log_level, settings.log_format);

    info!("Weft node v{}", env!("CARGO_PKG_VERSION"));
    info!(data_dir = %settings.data_dir.display(), "data directory");
    info!(listen = %settings.network.listen_multiaddr(), mdns = settings.network.enable_mdns, "p2p");
    info!(reserved = ?settings.network.reserved_peers, only = settings.network.reserved_only, "reserved peers");

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating {}", settings.data_dir.display()))?;

    let (chain, sessions) = dev_chain(settings.dev_blocks)?;
    info!(best = chain.best_number(), finalized = chain.finalized_number(), "chain ready");

    let node = NetworkNode::start(settings.network, chain, sessions)
        .await
        .context("starting network")?;
    info!(peer_id = %node.local_peer_id(), "Weft node running (Ctrl+C to stop)");

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status.tick() => log_status(node.service()),
            signal = tokio::signal::ctrl_c() => {
                signal.context("installing Ctrl+C handler")?;
                info!("received Ctrl+C, shutting down...");
                break;
            }
        }
        if !node.service().is_running() {
            info!("network worker exited");
            break;
        }
    }

    node.shutdown().await;
    info!("Weft node shutdown complete");
    Ok(())
}

/// The development chain: an empty genesis state and `blocks` blocks
/// signed by four fixed authorities.
fn dev_chain(blocks: u64) -> anyhow::Result<(Arc<MemoryChain>, Arc<dyn SessionInfoProvider>)> {
    let keys: Vec<AuthorityKey> = (1..=4).map(|i| AuthorityKey::from_seed([i; 32])).collect();
    let factory = BlockFactory::new(vec![keys]).finality_period(DEV_FINALITY_PERIOD);

    let chain = MemoryChain::with_genesis(Vec::new());
    if blocks > 0 {
        chain
            .import_blocks(factory.build_on(&chain.best_header(), blocks))
            .context("building the development chain")?;
    }
    let sessions = StaticSessionProvider::new(factory.authority_sets());
    Ok((Arc::new(chain), Arc::new(sessions)))
}

fn log_status(service: &NetworkService) {
    let status = service.status();
    info!(
        peers = status.num_connected_peers,
        mode = ?status.sync.mode,
        best = status.sync.best_imported,
        best_seen = status.sync.best_seen,
        bytes_in = status.total_bytes_inbound,
        bytes_out = status.total_bytes_outbound,
        "status"
    );
}

/// Initialize the tracing subscriber with the given level and format.
///
/// `RUST_LOG` overrides `level` when set.
fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init(),
    }
}

//! edge-gateway - edgesphere device gateway
//!
//! Terminates device connections, keeps device sessions alive and queues
//! commands for devices that are offline.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use edge_gateway::{
    DeviceId, GatewayConfig, GatewayListener, InMemoryRegistry, NodeId, NodeRing, SessionManager,
    DEFAULT_REPLICAS,
};
use edge_persist::OfflineStore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "edgesphere device gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/edge-gateway/config.toml")]
        config: PathBuf,

        /// Override the listener bind address
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Emit logs as JSON
        #[arg(long, env = "EDGE_GATEWAY_LOG_JSON")]
        log_json: bool,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/edge-gateway/config.toml")]
        output: PathBuf,
    },

    /// Show which gateway nodes own a device
    Route {
        /// Comma-separated gateway node ids
        #[arg(long, value_delimiter = ',', required = true)]
        nodes: Vec<String>,

        /// Virtual positions per node
        #[arg(long, default_value_t = DEFAULT_REPLICAS)]
        replicas: usize,

        /// Number of distinct nodes to list
        #[arg(long, default_value_t = 2)]
        count: usize,

        /// Device id
        device: String,
    },
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("edge_gateway=info".parse()?);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            bind,
            log_json,
        } => {
            init_tracing(log_json)?;
            run_gateway(config, bind).await?;
        }

        Commands::InitConfig { output } => {
            init_config(&output)?;
        }

        Commands::Route {
            nodes,
            replicas,
            count,
            device,
        } => {
            route(&nodes, replicas, count, &device);
        }
    }

    Ok(())
}

async fn run_gateway(config_path: PathBuf, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting edge-gateway");

    let mut config = GatewayConfig::from_file(&config_path)?;
    if let Some(addr) = bind {
        config.listener.bind_addr = addr;
    }

    let store = OfflineStore::open(&config.store.store_config())
        .with_context(|| format!("cannot open offline store at {}", config.store.path.display()))?;

    let ring = NodeRing::with_nodes(config.cluster.replicas, config.cluster.ring_members());
    info!(
        node = %config.cluster.node_id,
        nodes = ?ring.nodes(),
        replicas = ring.replicas(),
        "cluster ring built"
    );

    let manager = Arc::new(
        SessionManager::new(config.session.clone(), Arc::new(ring), Arc::new(store))
            .with_local_node(config.cluster.node_id.clone())
            .with_registry(Arc::new(build_registry(&config))),
    );
    manager.start(config.store.purge_interval());

    let listener = GatewayListener::bind(config.listener.clone(), Arc::clone(&manager)).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(e) => error!(error = %e, "failed to listen for interrupt"),
        }
        signal.cancel();
    });

    listener.serve(shutdown).await?;
    manager.shutdown().await?;
    info!("edge-gateway stopped");
    Ok(())
}

fn build_registry(config: &GatewayConfig) -> InMemoryRegistry {
    let registry = InMemoryRegistry::with_devices(config.registry.devices.iter().cloned());
    info!(
        devices = registry.len(),
        require_registered = config.listener.require_registered,
        "device registry loaded"
    );
    registry
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    let rendered = GatewayConfig::default().to_toml()?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    std::fs::write(output, rendered)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!("Wrote sample config to {}", output.display());
    Ok(())
}

fn route(nodes: &[String], replicas: usize, count: usize, device: &str) {
    let ring = NodeRing::with_nodes(replicas, nodes.iter().map(|n| NodeId::new(n.as_str())));
    let device = DeviceId::new(device);

    match ring.node_for(device.as_str()) {
        Some(owner) => println!("owner:    {owner}"),
        None => println!("owner:    (no nodes)"),
    }
    let candidates: Vec<String> = ring
        .nodes_for(device.as_str(), count)
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("failover: {}", candidates.join(", "));
}

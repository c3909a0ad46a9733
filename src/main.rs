//! TimeFleet - Coordinated UDP Time Service
//!
//! Runs a peer time server or the client-facing proxy.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timefleet::config::{LoggingConfig, ProxyConfig, TimeFleetConfig};
use timefleet::error::{Error, Result};
use timefleet::network::NodeServer;
use timefleet::proxy::ProxyServer;
use timefleet::state::{CoordinatorDirectory, MarkerFile, PeerAddress};

/// TimeFleet - Coordinated UDP Time Service
#[derive(Parser)]
#[command(name = "timefleet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "timefleet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides [logging].level
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a peer time server
    Node {
        /// This node's address; must be one of the configured peers
        #[arg(short, long)]
        address: PeerAddress,
    },

    /// Start the client-facing proxy
    Proxy {
        /// Address to listen on (defaults to [proxy].bind_address)
        #[arg(short, long)]
        listen: Option<PeerAddress>,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "timefleet.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Show cluster information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A broken config file is reported by the command itself
    let logging = TimeFleetConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    let level = cli.log_level.clone().unwrap_or_else(|| logging.level.clone());
    init_logging(&level, &logging);

    let result = match cli.command {
        Commands::Node { address } => run_node(&cli.config, address).await,
        Commands::Proxy { listen } => run_proxy(&cli.config, listen).await,
        Commands::Init { output } => run_init(&output),
        Commands::Validate => run_validate(&cli.config),
        Commands::Info => run_info(&cli.config),
    };

    if let Err(e) = &result {
        if e.is_fatal() {
            tracing::error!("Fatal error, shutting down: {}", e);
        }
    }
    result
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(config_path: &Path) -> Result<TimeFleetConfig> {
    TimeFleetConfig::from_file(config_path).map_err(|e| {
        tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
        e
    })
}

/// Start a peer node
async fn run_node(config_path: &Path, address: PeerAddress) -> Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        "Starting node {} ({} peers, marker {:?})",
        address,
        config.cluster.peers.len(),
        config.marker.path
    );

    let directory: Arc<dyn CoordinatorDirectory> = Arc::new(MarkerFile::new(&config.marker.path));
    let proxy = config.proxy_address();
    if proxy.is_none() {
        tracing::warn!("No [proxy] configured, coordinator announcements will only reach peers");
    }

    let server = NodeServer::bind(address, config.cluster.clone(), proxy, directory).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                tracing::error!("Node error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Start the proxy
async fn run_proxy(config_path: &Path, listen: Option<PeerAddress>) -> Result<()> {
    let config = load_config(config_path)?;

    let proxy_config = match (listen, config.proxy.clone()) {
        (Some(address), Some(proxy)) => ProxyConfig {
            bind_address: address,
            ..proxy
        },
        (Some(address), None) => ProxyConfig::new(address),
        (None, Some(proxy)) => proxy,
        (None, None) => {
            return Err(Error::Config(
                "no [proxy] section and no --listen address given".into(),
            ))
        }
    };

    let directory: Arc<dyn CoordinatorDirectory> = Arc::new(MarkerFile::new(&config.marker.path));
    let proxy = ProxyServer::bind(&proxy_config, directory).await?;

    println!("TimeFleet Proxy");
    println!("===============");
    println!();
    println!("Clients send TIME_REQUEST to {}.", proxy.local_addr());
    println!("Requests are forwarded to the current coordinator.");
    println!();

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                tracing::error!("Proxy error: {}", e);
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: &Path) -> Result<()> {
    std::fs::write(output, CONFIG_TEMPLATE)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the peer list, then start each node with:");
    println!("  timefleet --config {} node --address <ip:port>", output.display());
    println!("and the proxy with:");
    println!("  timefleet --config {} proxy", output.display());

    Ok(())
}

const CONFIG_TEMPLATE: &str = r#"# TimeFleet Configuration
# Generated configuration file

[cluster]
# Every node must list the same peers, including itself
peers = ["127.0.0.1:5555", "127.0.0.1:5556", "127.0.0.1:5557"]
health_check_interval_ms = 5000
health_check_timeout_ms = 1000
max_failed_checks = 3
election_timeout_ms = 2000
election_backoff_min_ms = 500
election_backoff_max_ms = 1000
coordinator_wait_ms = 5000

[proxy]
# Nodes send COORDINATOR_ANNOUNCE here, so use an address they can reach
bind_address = "127.0.0.1:8000"
forward_timeout_ms = 3000

[marker]
path = "coordinator.txt"

[logging]
level = "info"
format = "pretty"
"#;

/// Validate configuration file
fn run_validate(config_path: &Path) -> Result<()> {
    match TimeFleetConfig::from_file(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Peers: {}", config.cluster.peers.len());
            match config.proxy_address() {
                Some(proxy) => println!("  Proxy: {}", proxy),
                None => println!("  Proxy: (none)"),
            }
            println!("  Marker: {}", config.marker.path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show cluster information
fn run_info(config_path: &Path) -> Result<()> {
    let config = TimeFleetConfig::from_file(config_path)?;

    println!("TimeFleet Cluster Information");
    println!("=============================");
    println!();
    println!("Peers (highest rank first):");
    let mut peers = config.cluster.peers.clone();
    peers.sort_by(|a, b| b.rank().cmp(&a.rank()));
    for peer in &peers {
        println!("  {:<24} rank {}", peer.to_string(), peer.rank().ordinal());
    }
    println!();
    println!("Election Configuration:");
    println!(
        "  Health Check:   every {} ms, timeout {} ms",
        config.cluster.health_check_interval_ms, config.cluster.health_check_timeout_ms
    );
    println!("  Max Failures:   {}", config.cluster.max_failed_checks);
    println!("  Election:       {} ms", config.cluster.election_timeout_ms);
    println!(
        "  Backoff:        {}-{} ms",
        config.cluster.election_backoff_min_ms, config.cluster.election_backoff_max_ms
    );
    println!("  Coordinator Wait: {} ms", config.cluster.coordinator_wait_ms);
    println!();
    match &config.proxy {
        Some(proxy) => {
            println!("Proxy Configuration:");
            println!("  Bind Address:   {}", proxy.bind_address);
            println!("  Forward Timeout: {} ms", proxy.forward_timeout_ms);
        }
        None => println!("Proxy Configuration: (none)"),
    }
    println!();
    println!("Marker File:      {}", config.marker.path.display());

    Ok(())
}

//! TimeCtl - Command line client for a TimeFleet proxy
//!
//! Usage:
//!   timectl                       - Ask the configured proxy for the time every 3s
//!   timectl --proxy 10.0.0.9:8000 - Ask a specific proxy
//!   timectl --count 1             - Single request, then exit

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;

use timefleet::config::TimeFleetConfig;
use timefleet::protocol::{Message, MAX_DATAGRAM};

/// TimeFleet Client
#[derive(Parser)]
#[command(name = "timectl")]
#[command(about = "Request the time from a TimeFleet proxy", long_about = None)]
struct Cli {
    /// Path to config file, used when --proxy is not given
    #[arg(short, long, default_value = "timefleet.toml")]
    config: PathBuf,

    /// Proxy address to send requests to (overrides config)
    #[arg(short, long)]
    proxy: Option<SocketAddr>,

    /// Delay between requests in milliseconds
    #[arg(short, long, default_value_t = 3000)]
    interval_ms: u64,

    /// Stop after this many requests (runs until Ctrl+C when omitted)
    #[arg(short = 'n', long)]
    count: Option<u64>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let proxy = match cli.proxy {
        Some(proxy) => proxy,
        None => proxy_from_config(&cli.config)?,
    };
    if cli.interval_ms == 0 {
        bail!("--interval-ms must be greater than zero");
    }

    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .context("failed to bind client socket")?;

    println!("TimeFleet client (timectl v{})", env!("CARGO_PKG_VERSION"));
    println!("Proxy: {}", proxy);
    println!();

    let mut ticker = tokio::time::interval(Duration::from_millis(cli.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let request = Message::TimeRequest.encode();
    let mut sent = 0u64;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if cli.count.is_some_and(|count| sent >= count) {
                    break;
                }
                socket
                    .send_to(request.as_bytes(), proxy)
                    .await
                    .with_context(|| format!("failed to send request to {}", proxy))?;
                sent += 1;
                println!("Time request sent");
            }
            result = socket.recv_from(&mut buf) => {
                let (len, from) = result.context("receive failed")?;
                match Message::decode(&buf[..len]) {
                    Some(Message::Time { timestamp }) => println!("Time from {}: {}", from, timestamp),
                    _ => println!("Unexpected reply from {}: {}", from, String::from_utf8_lossy(&buf[..len])),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    Ok(())
}

fn proxy_from_config(path: &PathBuf) -> anyhow::Result<SocketAddr> {
    let config = TimeFleetConfig::from_file(path)
        .with_context(|| format!("failed to load {} (or pass --proxy)", path.display()))?;
    match config.proxy_address() {
        Some(address) => Ok(address.socket_addr()),
        None => bail!("{} has no [proxy] section; pass --proxy", path.display()),
    }
}

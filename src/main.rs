// Allow dead code - some accessors are kept for API completeness
#![allow(dead_code)]

//! dnsseedd — authoritative DNS seeder for Litecoin-family networks.
//!
//! Maintains a continuously refreshed directory of reachable peers per
//! configured network and answers DNS A/AAAA queries under the configured
//! hostnames so new clients can bootstrap without hard-coded addresses.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        DNSSEEDD                            │
//! ├────────────────────────────────────────────────────────────┤
//! │  Crawl scheduler (per network) ──▶ handshake crawl tasks   │
//! │  Address directory (per network) ◀─ crawl results, gossip  │
//! │  DNS view builder ──▶ process-wide record store            │
//! │  DNS server (UDP) ◀── A/AAAA queries from new clients      │
//! └────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::RwLock;
use tracing::{error, info};

mod config;
mod crawl;
mod dns;
mod node;
mod seeder;
mod stats;
mod wire;

use seeder::Seeder;

/// Authoritative DNS seeder for Litecoin-family peer-to-peer networks.
#[derive(Parser, Debug)]
#[command(name = "dnsseedd")]
#[command(version)]
#[command(about = "Authoritative DNS seeder for Litecoin-family networks", long_about = None)]
struct Args {
    /// Network definition files (JSON), one per seeded network
    #[arg(short = 'j', long = "netfile", required = true, num_args = 1..)]
    netfiles: Vec<PathBuf>,

    /// UDP port to answer DNS queries on (53 needs CAP_NET_BIND_SERVICE)
    #[arg(long, default_value = "8053")]
    dns_port: u16,

    /// Per-I/O deadline for manual crawls, seconds
    #[arg(long, default_value = "10")]
    io_timeout: u64,

    /// Log protocol-level crawl detail
    #[arg(long)]
    debug: bool,

    /// Periodically log per-network counters
    #[arg(long)]
    stats: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.debug {
        "debug".to_string()
    } else {
        args.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .init();

    info!("dnsseedd v{}", env!("CARGO_PKG_VERSION"));

    let configs = config::load_networks(&args.netfiles);
    if configs.is_empty() {
        anyhow::bail!("no usable network definitions");
    }

    let mut tasks = Vec::new();
    for cfg in configs {
        info!(
            "{}: seeding {} (magic {:#010x}, port {})",
            cfg.name, cfg.dns_host, cfg.magic, cfg.port
        );
        let counts = stats::register(&cfg.dns_host);
        let shared = Arc::new(RwLock::new(Seeder::new(cfg)));

        tasks.push(tokio::spawn(crawl::run(shared.clone(), args.io_timeout)));
        if args.stats {
            tasks.push(tokio::spawn(stats::run_reporter(shared.clone(), counts)));
        }
    }

    let dns_handle = tokio::spawn(dns::server::run(args.dns_port));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = dns_handle => {
            error!("DNS server exited: {result:?}");
        }
    }

    for task in tasks {
        task.abort();
    }

    info!("dnsseedd shutting down");
    Ok(())
}

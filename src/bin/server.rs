//! CradleKV Server Binary
//!
//! Starts one CradleKV host.

use std::sync::mpsc;

use clap::Parser;
use cradlekv::{Config, Cradle, KeyRange, StorageKind, SyncStrategy};
use tracing_subscriber::{fmt, EnvFilter};

/// CradleKV Server
#[derive(Parser, Debug)]
#[command(name = "cradlekv-server")]
#[command(about = "Range-partitioned distributed key-value node")]
#[command(version)]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./cradlekv_data")]
    data_dir: String,

    /// Listen address (host:port)
    #[arg(short, long, default_value = "127.0.0.1:7400")]
    listen: String,

    /// Address peers use to reach this host (defaults to the bound address)
    #[arg(short, long)]
    advertise: Option<String>,

    /// Maximum concurrent connections
    #[arg(short, long, default_value = "1024")]
    max_connections: usize,

    /// Router to create at startup if absent: name=start..end
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Range served by another host: start..end=name@host
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Keep router stores in memory only
    #[arg(long)]
    memory: bool,

    /// fsync the operation log after every write
    #[arg(long)]
    sync_every_write: bool,

    /// Background rebalance interval in milliseconds (0 disables)
    #[arg(short, long, default_value = "0")]
    rebalance_ms: u64,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,cradlekv=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("CradleKV Server v{}", cradlekv::VERSION);
    tracing::info!("Data directory: {}", args.data_dir);
    tracing::info!("Listen address: {}", args.listen);

    let storage = if args.memory {
        StorageKind::Memory
    } else if args.sync_every_write {
        StorageKind::Disk {
            sync: SyncStrategy::EveryWrite,
        }
    } else {
        Config::default().storage
    };

    // Build config from args
    let mut builder = Config::builder()
        .data_dir(&args.data_dir)
        .listen_addr(&args.listen)
        .max_connections(args.max_connections)
        .storage(storage)
        .rebalance_interval_ms(args.rebalance_ms);
    if let Some(advertise) = &args.advertise {
        builder = builder.advertise_addr(advertise);
    }
    for peer in &args.peers {
        builder = builder.peer(peer);
    }
    let config = builder.build();

    let nodes = match parse_nodes(&args.nodes) {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!("Invalid --node: {}", e);
            std::process::exit(2);
        }
    };

    let cradle = match Cradle::open(config) {
        Ok(cradle) => cradle,
        Err(e) => {
            tracing::error!("Failed to open cradle: {}", e);
            std::process::exit(1);
        }
    };

    for (name, range) in nodes {
        if cradle.router(&name).is_some() {
            tracing::info!("Router {} already recovered, skipping --node", name);
            continue;
        }
        if let Err(e) = cradle.create_node(&name, range) {
            tracing::error!("Failed to create router {}: {}", name, e);
            cradle.shutdown();
            std::process::exit(1);
        }
    }

    tracing::info!("Cradle serving on {}", cradle.host());

    // Block until Ctrl+C
    let (stop, stopped) = mpsc::channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = stop.send(());
    }) {
        tracing::error!("Failed to install Ctrl+C handler: {}", e);
        cradle.shutdown();
        std::process::exit(1);
    }
    let _ = stopped.recv();

    tracing::info!("Received Ctrl+C, initiating shutdown...");
    cradle.shutdown();
    tracing::info!("Server stopped");
}

/// Parse `name=start..end` pairs
fn parse_nodes(specs: &[String]) -> cradlekv::Result<Vec<(String, KeyRange)>> {
    specs
        .iter()
        .map(|spec| {
            let (name, range) = spec.split_once('=').ok_or_else(|| {
                cradlekv::CradleError::Config(format!("expected name=start..end, got {:?}", spec))
            })?;
            Ok((name.to_string(), range.parse()?))
        })
        .collect()
}

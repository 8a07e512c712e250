//! sprox simulator
//!
//! Drives many storage proxies against one in-memory backing store and checks
//! that every replica converges on the store's final state.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (3 contexts, 2 consumers each, 50 ops per consumer)
//! sprox-sim
//!
//! # Reproduce a run
//! sprox-sim --seed 1234 --contexts 8 --ops 200
//!
//! # With configuration file
//! sprox-sim --config sim.toml
//!
//! # Host an in-memory store over TCP instead of simulating
//! sprox-sim --serve 127.0.0.1:6390 --format msgpack
//! ```

mod config;
mod link;
mod sim;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use sprox_protocol::Format;
use sprox_store::MemoryStore;
use sprox_transport::TcpServer;

use crate::config::SimConfig;

/// sprox simulator - storage proxy convergence runs
#[derive(Parser, Debug)]
#[command(name = "sprox-sim")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "SPROX_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "SPROX_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Number of proxy contexts
    #[arg(long, env = "SPROX_CONTEXTS")]
    contexts: Option<usize>,

    /// Consumers per context
    #[arg(long, env = "SPROX_CONSUMERS")]
    consumers: Option<usize>,

    /// Operations per consumer
    #[arg(long, env = "SPROX_OPS")]
    ops: Option<usize>,

    /// Distinct collection ids written to
    #[arg(long, env = "SPROX_ITEMS")]
    items: Option<usize>,

    /// Maximum delay added to each message, in milliseconds
    #[arg(long, env = "SPROX_MAX_DELAY_MS")]
    max_delay_ms: Option<u64>,

    /// RNG seed for a reproducible run
    #[arg(long, env = "SPROX_SEED")]
    seed: Option<u64>,

    /// Update broadcast capacity per store
    #[arg(long, env = "SPROX_EVENT_CAPACITY")]
    event_capacity: Option<usize>,

    /// Wire format for framed links (json, msgpack)
    #[arg(long, env = "SPROX_FORMAT")]
    format: Option<Format>,

    /// Serve an in-memory store on this address instead of simulating
    #[arg(long, env = "SPROX_SERVE")]
    serve: Option<SocketAddr>,
}

impl Args {
    /// Command line values override the file, which overrides the defaults
    fn resolve(&self) -> Result<SimConfig> {
        let mut config = match &self.config {
            Some(path) => SimConfig::load(path)?,
            None => SimConfig::default(),
        };

        if let Some(contexts) = self.contexts {
            config.contexts = contexts;
        }
        if let Some(consumers) = self.consumers {
            config.consumers = consumers;
        }
        if let Some(ops) = self.ops {
            config.ops = ops;
        }
        if let Some(items) = self.items {
            config.items = items;
        }
        if let Some(max_delay_ms) = self.max_delay_ms {
            config.max_delay_ms = max_delay_ms;
        }
        if let Some(event_capacity) = self.event_capacity {
            config.event_capacity = event_capacity;
        }
        if let Some(format) = self.format {
            config.transport.format = format;
        }
        config.seed = self.seed.or(config.seed);

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = args.resolve()?;

    if let Some(addr) = args.serve {
        let store = Arc::new(MemoryStore::with_event_capacity(config.event_capacity));
        let server = TcpServer::new(store, addr, config.transport.clone());

        tokio::select! {
            result = server.run() => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
        }
        return Ok(());
    }

    let report = sim::run(&config).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.converged {
        anyhow::bail!(
            "{} replica(s) diverged from the store (seed {})",
            report.mismatches.len(),
            report.seed
        );
    }
    Ok(())
}

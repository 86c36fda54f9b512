//! Switchboard Daemon - Line-Oriented Router Host
//!
//! Hosts a [`Router`](switchboard_core::Router) as a process: requests arrive
//! as newline-delimited JSON on stdin and replies leave the same way on
//! stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/switchboard/router.toml)
//! switchboard-daemon
//!
//! # With config file and durable state
//! switchboard-daemon --config /etc/switchboard/router.toml --data-dir /var/lib/switchboard
//!
//! # One request
//! echo '{"id":1,"prompt":"hello","user_id":"u1"}' | switchboard-daemon
//!
//! # Verbose logging
//! RUST_LOG=debug switchboard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Reload configuration (backends and routing policy)

mod server;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use switchboard_core::routing::CachingStrategy;
use switchboard_core::telemetry::init_logging;
use switchboard_core::{default_config_path, ConfigOverrides};

use server::DaemonServer;

/// Switchboard Daemon - resilient multi-backend inference router
#[derive(Parser, Debug)]
#[command(name = "switchboard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHBOARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHBOARD_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Directory for cache, preference, experiment and usage files
    #[arg(short = 'd', long, env = "SWITCHBOARD_DATA_DIR", value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Override the attempt limit per request
    #[arg(long, value_name = "N")]
    max_retries: Option<u32>,

    /// Override the default caching strategy (aggressive, moderate, minimal)
    #[arg(long, value_name = "STRATEGY")]
    cache_strategy: Option<CachingStrategy>,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(max_retries) = self.max_retries {
            overrides = overrides.with_max_retries(max_retries);
        }
        if let Some(strategy) = self.cache_strategy {
            overrides = overrides.with_cache_strategy(strategy);
        }
        overrides
    }
}

/// Flip the shared flags on SIGTERM/SIGINT/SIGHUP
fn spawn_signal_handler(shutdown: Arc<AtomicBool>, reload: Arc<AtomicBool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking config for reload");
                    reload.store(true, Ordering::SeqCst);
                }
            }
        }
    });
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Switchboard daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let config_path = args.config.clone().or_else(default_config_path);
    if let Some(ref path) = config_path {
        info!(config_path = ?path, "Config file");
    }

    let overrides = args.overrides();
    let config = server::load(config_path.clone(), &overrides)?;
    info!(
        backends = config.router.backends.len(),
        source = %config.source(),
        "Configuration loaded"
    );

    let router = Arc::new(server::build_router(&config, args.data_dir.as_deref()).await?);
    router.start();

    // Setup signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_config = Arc::new(AtomicBool::new(false));
    spawn_signal_handler(Arc::clone(&shutdown), Arc::clone(&reload_config))?;

    // Run the server
    let server = DaemonServer::new(Arc::clone(&router), config_path, overrides);
    let result = server
        .run(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            shutdown,
            reload_config,
        )
        .await;

    // Cleanup
    info!("Shutting down...");
    router.shutdown().await;

    match result {
        Ok(()) => {
            info!("Switchboard daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

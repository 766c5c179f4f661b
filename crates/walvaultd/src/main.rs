//! walvault daemon
//!
//! Usage:
//!   walvaultd <config.yaml>
//!
//! Streams the configured publication into per-table segmented backup
//! files until SIGINT or SIGTERM. Exits 0 on a clean shutdown, 1 on a
//! startup failure or a fatal replication error.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walvault::{Config, Engine, Shutdown};

#[derive(Debug, Parser)]
#[command(name = "walvaultd", about = "PostgreSQL logical-replication backup daemon")]
struct Cli {
    /// Path to the YAML configuration file
    config: PathBuf,

    /// Log filter when RUST_LOG is not set (e.g. info, walvault=debug)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        staging = %config.staging_dir.display(),
        archive = %config.archive_dir.display(),
        "backup directories"
    );
    tracing::info!(
        host = %config.db.host,
        port = config.db.port,
        dbname = %config.db.dbname,
        slot = %config.slot_name,
        publication = %config.publication,
        track_new_tables = config.track_new_tables,
        "upstream target"
    );

    let shutdown = Shutdown::new();
    tokio::spawn(handle_signals(shutdown.clone()));

    let mut engine = match Engine::bootstrap(config, shutdown.clone()).await {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("could not start backup engine: {e}");
            std::process::exit(1);
        }
    };

    engine.run();
    engine.wait().await;

    if engine.failed() {
        tracing::error!("engine stopped on a fatal error");
        std::process::exit(1);
    }

    tracing::info!("shut down cleanly");
    Ok(())
}

/// SIGINT and SIGTERM trigger a graceful shutdown; SIGHUP is consumed and
/// ignored.
async fn handle_signals(shutdown: Shutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    loop {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::error!("could not listen for SIGINT: {e}");
                }
                tracing::info!("received SIGINT, shutting down");
                shutdown.trigger();
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                shutdown.trigger();
                return;
            }
            _ = sighup.recv() => {
                tracing::debug!("ignoring SIGHUP");
            }
        }
    }
}

//! Patchfleet aggregator daemon.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use patchfleet_common::{DaemonSettings, init_logging};
use patchfleetd::api::{self, ApiSettings, AppState};
use patchfleetd::logs::LogStore;
use patchfleetd::store::{TICKETS_FILE, TicketStore};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "patchfleetd")]
#[command(author, version, about = "Patchfleet daemon - ticket store and report aggregation")]
struct Cli {
    /// Path to the daemon configuration file
    #[arg(short, long, env = "PATCHFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, env = "PATCHFLEET_LISTEN")]
    listen: Option<String>,

    /// Directory for tickets.jsonl and logs (overrides the config file)
    #[arg(long, env = "PATCHFLEET_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, env = "PATCHFLEET_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        DaemonSettings::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(listen) = cli.listen {
        settings.listen = listen;
    }
    if let Some(dir) = cli.data_dir {
        settings.data_dir = Some(dir);
    }
    settings.validate().context("Invalid configuration")?;

    let _log_guards = init_logging(&settings.log.clone().verbose(cli.verbose))
        .context("Failed to initialize logging")?;

    info!("Starting patchfleet daemon...");

    let (store, logs) = match &settings.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create data directory {:?}", dir))?;
            let path = dir.join(TICKETS_FILE);
            let store = if path.exists() {
                match TicketStore::load_from_file(&path) {
                    Ok(store) => {
                        info!("Loaded tickets from {:?} ({} tickets)", path, store.len());
                        store
                    }
                    Err(e) => {
                        warn!("Failed to load tickets from {:?}: {}", path, e);
                        TicketStore::new().with_persistence(path)
                    }
                }
            } else {
                info!("Creating new ticket store at {:?}", path);
                TicketStore::new().with_persistence(path)
            };
            (store, LogStore::on_disk(dir.join("logs")))
        }
        None => {
            info!("Ticket store in-memory only (no persistence)");
            (TicketStore::new(), LogStore::in_memory())
        }
    };

    let api_settings = ApiSettings {
        lease: settings.lease_policy(),
        submission: settings.submission_policy(),
        trusted_authors: settings.trusted_authors.clone(),
        ticket_limit: settings.ticket_limit,
        latest_base_refresh: settings.latest_base_refresh(),
    };
    let state = Arc::new(AppState::new(store, logs, api_settings));
    let addr = settings.listen_addr()?;

    api::serve(addr, Arc::clone(&state), shutdown_signal())
        .await
        .with_context(|| format!("HTTP server on {} failed", addr))?;

    if let Err(e) = state.store.compact() {
        warn!("Failed to compact ticket store: {}", e);
    }
    info!("Daemon shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}

//! Patchfleet worker agent.
//!
//! Pulls candidate tickets from the aggregator, picks the most valuable one
//! for this machine, tests it, and posts the result.

#![forbid(unsafe_code)]

mod client;
mod git;
mod tester;
mod worker;

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use patchfleet_common::{WorkerSettings, init_logging};
use tracing::info;

use client::DaemonClient;
use git::GitDistance;
use tester::CommandTester;
use worker::{CycleOutcome, Worker};

#[derive(Parser)]
#[command(name = "patchfleet-wkr")]
#[command(author, version, about = "Patchfleet worker agent - ticket testing")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the worker configuration file
    #[arg(short, long, global = true, env = "PATCHFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Aggregator base URL (overrides the config file)
    #[arg(short, long, global = true, env = "PATCHFLEET_SERVER")]
    server: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true, env = "PATCHFLEET_VERBOSE")]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Test tickets until interrupted
    Run,

    /// Run a single selection and test cycle
    Once,

    /// Print the ranked candidate list without testing
    Rate {
        /// Number of rows to print
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Print the detected machine identity
    Machine,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings =
        WorkerSettings::load_or_default(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(server) = cli.server {
        settings.server = server;
    }
    settings.validate().context("Invalid configuration")?;

    let _log_guards = init_logging(&settings.log.clone().verbose(cli.verbose))
        .context("Failed to initialize logging")?;

    let machine = settings.machine_id();
    if let Commands::Machine = cli.command {
        println!("{}", machine);
        return Ok(());
    }

    let client = DaemonClient::new(&settings.server);
    let tester = CommandTester::new(settings.test_command.clone().unwrap_or_default())
        .with_workdir(settings.repo.clone());

    let git = settings
        .repo
        .as_ref()
        .map(|repo| GitDistance::new(repo, settings.base_ref.clone()));
    let git_base = git.as_ref().and_then(GitDistance::base_commit);
    if let Some(git) = &git {
        info!(
            "Using history of {:?} ({} at {})",
            git.repo(),
            settings.base_ref,
            git_base.as_deref().unwrap_or("unknown")
        );
    }

    info!("Worker {} talking to {}", machine, settings.server);
    let mut worker = Worker::new(settings, machine, client, tester);
    if let Some(git) = git {
        worker = worker.with_distance(Box::new(git), git_base);
    }

    match cli.command {
        Commands::Run => worker.run().context("Worker stopped")?,
        Commands::Once => match worker.run_once(Utc::now()).context("Cycle failed")? {
            CycleOutcome::Idle => println!("nothing to test"),
            CycleOutcome::Reported { id, status } => println!("#{id}: {status}"),
            CycleOutcome::Skipped { id, reason } => println!("#{id}: skipped ({reason:?})"),
        },
        Commands::Rate { limit } => {
            let ranked = worker.rank(Utc::now()).context("Failed to rate tickets")?;
            for selection in ranked.iter().take(limit) {
                println!(
                    "#{:<6} {:<32} {}",
                    selection.ticket.id,
                    selection.rating.to_string(),
                    selection.ticket.title
                );
            }
        }
        Commands::Machine => {}
    }
    Ok(())
}

//! Command-line interface
//!
//! `run` starts the engine as a foreground daemon; `queue` and `positions`
//! inspect persisted state without touching the network, so they work
//! offline and while a daemon is running.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::config::EngineConfig;
use crate::data_paths::{DataPaths, DEFAULT_DATA_DIR};
use crate::ledger::PositionLedger;
use crate::logging::{init_logging, LogMode, LoggingConfig};
use crate::queue::{MutationQueue, MutationStatus};
use crate::store::JsonStore;
use crate::sync::SyncEngine;
use crate::types::Position;

#[derive(Parser)]
#[command(name = "crickstox")]
#[command(version)]
#[command(about = "Sync engine for the cricket player trading API", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Data directory path (default: ./data)
    #[arg(long, global = true, default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Config file path; defaults apply when the file does not exist
    #[arg(long, global = true, default_value = "crickstox.json")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the engine in the foreground until interrupted
    Run(RunArgs),

    /// Show the persisted mutation queue
    Queue,

    /// Show persisted positions
    Positions,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// API session token
    #[arg(long, env = "CRICKSTOX_TOKEN")]
    pub token: String,

    /// User id for wallet operations
    #[arg(long, env = "CRICKSTOX_USER_ID")]
    pub user_id: String,

    /// Topics to subscribe on startup, e.g. PLAYER:kohli
    #[arg(long = "topic")]
    pub topics: Vec<String>,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let data_paths = DataPaths::new(&self.data_dir);
        let config = EngineConfig::load(&self.config)?;

        match self.command {
            Commands::Run(args) => run(args, config, data_paths).await,
            Commands::Queue => show_queue(data_paths),
            Commands::Positions => show_positions(data_paths),
        }
    }
}

async fn run(args: RunArgs, config: EngineConfig, data_paths: DataPaths) -> Result<()> {
    init_logging(LoggingConfig::new(LogMode::ConsoleAndFile, data_paths.clone()))?;

    let engine = SyncEngine::new(config, &data_paths, &args.token, &args.user_id)
        .context("failed to initialize sync engine")?;
    engine.start().await;

    for topic in &args.topics {
        engine.subscribe(topic.clone())?;
        info!(topic = %topic, "subscribed");
    }
    engine.connect()?;

    info!("engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");
    engine.shutdown().await;
    Ok(())
}

fn show_queue(data_paths: DataPaths) -> Result<()> {
    let queue = MutationQueue::open(JsonStore::new(data_paths.queue()));
    if queue.is_empty() {
        println!("queue is empty");
        return Ok(());
    }

    println!("{} record(s):", queue.len());
    for record in queue.pending() {
        print_record(&record);
    }
    for record in queue.failed() {
        print_record(&record);
    }
    Ok(())
}

fn print_record(record: &crate::queue::MutationRecord) {
    let status = match record.status {
        MutationStatus::Pending => "pending",
        MutationStatus::InFlight => "in flight",
        MutationStatus::FailedPermanent => "FAILED",
    };
    println!(
        "  {}  {:<20}  {}  attempts={}  enqueued={}",
        record.id,
        record.entity,
        status,
        record.attempts,
        record.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
    );
    if let Some(error) = &record.last_error {
        println!("      last error: {error}");
    }
}

fn show_positions(data_paths: DataPaths) -> Result<()> {
    let store = JsonStore::new(data_paths.sync());
    let mut ledger = PositionLedger::new();
    if let Some(positions) = store.load::<Vec<Position>>("positions") {
        ledger.restore(positions);
    }

    let positions = ledger.positions();
    if positions.is_empty() {
        println!("no positions");
        return Ok(());
    }

    println!("{:<24} {:>10} {:>14} {:>14}", "symbol", "qty", "avg cost", "realized pnl");
    for position in positions {
        println!(
            "{:<24} {:>10} {:>14} {:>14}",
            position.symbol.to_string(),
            position.quantity,
            position.average_cost,
            position.realized_pnl,
        );
    }
    Ok(())
}

//! Command-line interface for the job registry indexer.
//!
//! # Commands
//!
//! - `run`: follow the chain until ctrl-c
//! - `sync`: catch up to the current head once and exit
//! - `status`: print the checkpoint and projection counts from the database
//!
//! # Example
//!
//! ```bash
//! # Follow the chain, polling every 5 seconds
//! job-registry-indexer run --interval 5
//!
//! # One-shot catch-up from block 1200 on an empty database
//! job-registry-indexer sync --start-block 1200
//!
//! # Inspect progress
//! job-registry-indexer status
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use crate::chain::RpcChainClient;
use crate::config::{Config, DEFAULT_DATABASE_URL};
use crate::db::{create_pool, Repository};
use crate::error::{IndexerError, IndexerResult};
use crate::indexer::{Indexer, IndexerStatus};

/// Job registry event indexer
#[derive(Parser, Debug)]
#[command(name = "job-registry-indexer")]
#[command(about = "Ledger-to-relational indexer for the job registry contract", long_about = None)]
#[command(version)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Follow the chain until ctrl-c
    Run {
        /// First block when the database has no progress yet (overrides START_BLOCK)
        #[arg(short, long)]
        start_block: Option<u64>,

        /// Polling interval in seconds (overrides POLL_INTERVAL_SECS)
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Catch up to the current head once and exit
    Sync {
        /// First block when the database has no progress yet (overrides START_BLOCK)
        #[arg(short, long)]
        start_block: Option<u64>,
    },

    /// Show checkpoint and projection counts
    Status {
        /// SQLite database (default: DATABASE_URL, then sqlite:./indexer.db)
        #[arg(long)]
        database_url: Option<String>,

        /// Number of recent events to list
        #[arg(short, long, default_value = "5")]
        recent: i64,
    },
}

/// Parse CLI arguments and execute the appropriate command.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration loading fails
/// - The database cannot be opened or migrated
/// - A one-shot sync fails
pub async fn run() -> IndexerResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            start_block,
            interval,
        } => run_follow_command(start_block, interval).await,
        Commands::Sync { start_block } => run_sync_command(start_block).await,
        Commands::Status {
            database_url,
            recent,
        } => run_status_command(database_url, recent).await,
    }
}

/// Load config, apply CLI overrides and assemble an indexer.
async fn build_indexer(
    start_block: Option<u64>,
    interval: Option<u64>,
) -> IndexerResult<(Indexer, Repository)> {
    let mut config = Config::from_env()?;
    if let Some(block) = start_block {
        config.indexer_mut().start_block = block;
    }
    if let Some(secs) = interval {
        config.indexer_mut().poll_interval = Duration::from_secs(secs);
    }

    let repository = Repository::new(create_pool(config.database_url()).await?);
    let chain = Arc::new(RpcChainClient::connect(
        config.rpc_url(),
        config.contract_address(),
    )?);

    info!(
        contract = config.contract_address(),
        start_block = config.indexer().start_block,
        "Indexer configured"
    );

    let indexer = Indexer::new(repository.clone(), chain, config.indexer().clone());
    Ok((indexer, repository))
}

/// Execute the run command (continuous indexing).
async fn run_follow_command(start_block: Option<u64>, interval: Option<u64>) -> IndexerResult<()> {
    let (indexer, _repository) = build_indexer(start_block, interval).await?;

    println!("{}", "🔍 Indexing job registry events...".cyan().bold());
    println!("{}", "   Press ctrl-c to stop".dimmed());
    println!();

    indexer.start();

    tokio::signal::ctrl_c().await.map_err(|e| {
        IndexerError::config("Failed to listen for shutdown signal", Some(Box::new(e)))
    })?;

    info!("Shutdown signal received");
    println!();
    println!("{}", "🛑 Shutting down gracefully...".yellow().bold());

    indexer.stop().await;
    print_status(&indexer.status());

    println!("{}", "👋 Shutdown complete".green().bold());
    Ok(())
}

/// Execute the sync command (one-shot catch-up).
async fn run_sync_command(start_block: Option<u64>) -> IndexerResult<()> {
    let (indexer, _repository) = build_indexer(start_block, None).await?;

    println!("{}", "⏩ Catching up to chain head...".cyan().bold());
    let report = indexer.catch_up().await?;

    println!(
        "{} Scanned from block {} to {}",
        "✅".green(),
        report.start_block.to_string().yellow(),
        report
            .last_processed_block
            .map_or_else(|| "-".to_string(), |b| b.to_string())
            .yellow()
    );
    print_status(&indexer.status());
    Ok(())
}

/// Execute the status command (read-only).
async fn run_status_command(database_url: Option<String>, recent: i64) -> IndexerResult<()> {
    dotenvy::dotenv().ok();
    let database_url = database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

    let repository = Repository::new(create_pool(&database_url).await?);

    let checkpoint = repository.load_checkpoint().await?;
    let max_block = repository.max_block().await?;
    let counts = repository.event_counts().await?;
    let workers = repository.count_workers().await?;
    let jobs = repository.count_jobs_by_status().await?;

    println!("{}", "📊 Indexer status".cyan().bold());
    println!(
        "   Checkpoint:          {}",
        format_block(checkpoint).yellow()
    );
    println!(
        "   Highest event block: {}",
        format_block(max_block).yellow()
    );
    println!(
        "   Events:              {} stored, {} processed, {} unknown",
        counts.total.to_string().bold(),
        counts.processed.to_string().green(),
        counts.unknown.to_string().magenta()
    );
    println!("   Workers:             {}", workers.to_string().bold());

    if jobs.is_empty() {
        println!("   Jobs:                {}", "none".dimmed());
    } else {
        let summary = jobs
            .iter()
            .map(|(status, count)| format!("{count} {status}"))
            .collect::<Vec<_>>()
            .join(", ");
        println!("   Jobs:                {summary}");
    }

    if recent > 0 {
        let events = repository.get_recent_events(recent).await?;
        if !events.is_empty() {
            println!();
            println!("{}", "   Recent events".bold());
        }
        for event in events {
            let marker = if event.processed {
                "✔".green()
            } else {
                "…".yellow()
            };
            println!(
                "   {} {} {} {}:{}",
                marker,
                event.block_number.to_string().yellow(),
                event.event_name.blue(),
                event.transaction_hash.dimmed(),
                event.event_index
            );
        }
    }

    Ok(())
}

fn format_block(block: Option<u64>) -> String {
    block.map_or_else(|| "none".to_string(), |b| b.to_string())
}

fn print_status(status: &IndexerStatus) {
    println!(
        "{} Last processed block: {}",
        "📍".cyan(),
        format_block(status.last_processed_block).yellow()
    );
    println!(
        "   Chain head: {} | Events: {} | Anomalies: {} | Duplicate keys: {} | Chunks: {}",
        format_block(status.chain_head).yellow(),
        status.events_ingested.to_string().green(),
        status.anomalies.to_string().magenta(),
        status.duplicate_keys.to_string().red(),
        status.chunks
    );
    if let Some(error) = &status.last_error {
        println!("{} {}", "⚠️  Last error:".red().bold(), error);
    }
}

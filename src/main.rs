//! CLI entry point for the job registry indexer.
//!
//! # Architecture Flow
//!
//! ```text
//! main.rs (Runtime Initialization)
//!     ↓
//! CLI Layer (src/cli.rs)
//!     ↓
//! 1. Config Layer (src/config.rs)         → Load environment variables
//! 2. Storage Layer (src/db)               → Open SQLite, run migrations
//! 3. Chain Layer (src/chain)              → Create alloy HTTP provider
//! 4. Indexer Layer (src/indexer)          → Recover, poll, ingest, back off
//! 5. Projection Layer (src/projection)    → Workers, jobs, reputation
//! ```
//!
//! All errors bubble up with context via `IndexerResult<T>`.

use job_registry_indexer::{cli, observability};
use tracing::error;

/// Entry point for the job registry indexer.
///
/// Initializes:
/// - Tokio async runtime (via `#[tokio::main]`)
/// - Structured logging with tracing
/// - Environment-based filtering (`RUST_LOG`, `LOG_JSON`, `LOG_FILE`)
///
/// Then delegates to the CLI module for all business logic.
#[tokio::main]
async fn main() {
    // Examples:
    //   RUST_LOG=debug cargo run -- run
    //   RUST_LOG=job_registry_indexer=trace,sqlx=warn cargo run -- sync
    //   LOG_JSON=true LOG_FILE=./logs/indexer.log cargo run -- run
    let log_level = std::env::var("RUST_LOG").ok();
    let log_file = std::env::var("LOG_FILE").ok().map(std::path::PathBuf::from);
    let json_output = std::env::var("LOG_JSON")
        .unwrap_or_else(|_| "false".to_string())
        .parse::<bool>()
        .unwrap_or(false);

    // Held until exit so buffered file output is flushed.
    let _log_guard = match observability::init_tracing(log_level, log_file, json_output) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize tracing: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = cli::run().await {
        error!(error = %e, "Application error");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

//! SQLite persistence for raw events and the derived projection.
//!
//! Tables:
//! - `contract_events`: raw decoded events, unique on `(transaction_hash, event_index)`
//! - `workers`, `jobs`, `job_events`, `reputation_history`: the projection
//! - `indexer_checkpoint`: single row with the last fully ingested block
//!
//! # Architecture
//!
//! - `models`: row structs for every table
//! - `repository`: Event Store operations and read-side queries
//! - `unit_of_work`: the per-event transaction used by ingestion
//! - WAL mode so API readers never block on (or observe half of) an indexer write

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{db_err, IndexerError, IndexerResult};

pub mod models;
pub mod repository;
pub mod unit_of_work;

pub use repository::Repository;
pub use unit_of_work::UnitOfWork;

/// Tables that must exist after migrations.
pub const REQUIRED_TABLES: [&str; 6] = [
    "contract_events",
    "workers",
    "jobs",
    "job_events",
    "reputation_history",
    "indexer_checkpoint",
];

/// Creates a SQLite connection pool and brings the schema up to date.
///
/// # Configuration
///
/// - **WAL mode**: concurrent readers during writes
/// - **Busy timeout**: 30 seconds to ride out lock contention
/// - **Foreign keys**: enforced on every connection
/// - **Max connections**: 5, or 1 for `:memory:` databases, since every
///   in-memory connection would otherwise see its own empty database
///
/// # Example
///
/// ```no_run
/// use job_registry_indexer::db::create_pool;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let pool = create_pool("sqlite:./indexer.db").await?;
///     Ok(())
/// }
/// ```
///
/// # Errors
///
/// Returns an error if the URL is malformed, the database cannot be opened,
/// or migrations fail.
pub async fn create_pool(database_url: &str) -> IndexerResult<SqlitePool> {
    info!(database_url, "Connecting to database");

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| {
            IndexerError::database(
                format!("Failed to parse database URL: {database_url}"),
                Some(Box::new(e)),
            )
        })?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30));

    let in_memory = database_url.contains(":memory:");
    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 5 })
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5));
    if in_memory {
        pool_options = pool_options.idle_timeout(None).max_lifetime(None);
    }

    let pool = pool_options.connect_with(options).await.map_err(|e| {
        IndexerError::database(
            format!("Failed to connect to database at {database_url}"),
            Some(Box::new(e)),
        )
    })?;

    info!("Running database migrations");
    run_migrations(&pool).await?;
    verify_database(&pool).await?;
    info!("Database migrations complete");

    Ok(pool)
}

/// Applies pending migrations from `migrations/`.
///
/// # Errors
///
/// Returns an error if a migration fails to apply.
pub async fn run_migrations(pool: &SqlitePool) -> IndexerResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| {
            IndexerError::database("Failed to run database migrations", Some(Box::new(e)))
        })?;

    Ok(())
}

/// Verify that every table in [`REQUIRED_TABLES`] exists.
///
/// # Errors
///
/// Returns an error listing the count found when the schema is incomplete.
pub async fn verify_database(pool: &SqlitePool) -> IndexerResult<()> {
    let rows = sqlx::query_as::<_, (String,)>(
        r"
        SELECT name FROM sqlite_master
        WHERE type = 'table'
          AND name IN ('contract_events', 'workers', 'jobs', 'job_events',
                       'reputation_history', 'indexer_checkpoint')
        ",
    )
    .fetch_all(pool)
    .await
    .map_err(db_err("Failed to verify database schema"))?;

    if rows.len() < REQUIRED_TABLES.len() {
        return Err(IndexerError::database(
            format!(
                "Database schema incomplete. Expected {} tables, found {}",
                REQUIRED_TABLES.len(),
                rows.len()
            ),
            None,
        ));
    }

    Ok(())
}

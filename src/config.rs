//! Configuration management for the job registry indexer.
//!
//! Configuration is read from environment variables, with a `.env` file
//! loaded first via `dotenvy` when present.
//!
//! ## Environment Variables
//!
//! Required:
//! - `RPC_URL`: HTTP(S) JSON-RPC endpoint of the chain node
//! - `CONTRACT_ADDRESS`: job registry contract to index (0x + 40 hex chars)
//!
//! Optional (with defaults):
//! - `DATABASE_URL`: SQLite database (default: `sqlite:./indexer.db`)
//! - `START_BLOCK`: first block to index when no checkpoint exists (default: 0)
//! - `POLL_INTERVAL_SECS`: delay between head polls once caught up (default: 10)
//! - `CHUNK_SIZE_BLOCKS`: blocks fetched per `getLogs` request (default: 100)
//! - `BACKOFF_SECS`: delay after a failed polling pass (default: 10)
//! - `RUST_LOG`: logging level (default: "info")
//!
//! ## Example
//!
//! ```no_run
//! use job_registry_indexer::config::Config;
//! use job_registry_indexer::error::IndexerResult;
//!
//! # fn main() -> IndexerResult<()> {
//! let config = Config::from_env()?;
//! println!("Indexing {} from block {}", config.contract_address(), config.indexer().start_block);
//! # Ok(())
//! # }
//! ```

use crate::error::{IndexerError, IndexerResult};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Database used when `DATABASE_URL` is unset.
pub const DEFAULT_DATABASE_URL: &str = "sqlite:./indexer.db";

/// Operational controls of the indexer loop.
///
/// Kept separate from [`Config`] so the loop can be constructed directly in
/// tests and embedding processes without touching the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexerSettings {
    /// Inclusive lower bound used when no checkpoint exists yet.
    pub start_block: u64,
    /// Sleep between head polls once the indexer has caught up.
    pub poll_interval: Duration,
    /// Number of blocks requested per chunk.
    pub chunk_size: u64,
    /// Fixed delay after a failed polling pass.
    pub backoff: Duration,
}

impl Default for IndexerSettings {
    fn default() -> Self {
        Self {
            start_block: 0,
            poll_interval: Duration::from_secs(10),
            chunk_size: 100,
            backoff: Duration::from_secs(10),
        }
    }
}

/// Main configuration struct for the indexer process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Chain node JSON-RPC endpoint
    rpc_url: String,

    /// Job registry contract address (lowercase hex)
    contract_address: String,

    /// SQLite connection string
    database_url: String,

    /// Loop controls
    indexer: IndexerSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `RPC_URL` or `CONTRACT_ADDRESS` is missing
    /// - A numeric variable is not a valid number
    /// - `CHUNK_SIZE_BLOCKS` is zero
    /// - The contract address is not 0x + 40 hex characters
    pub fn from_env() -> IndexerResult<Self> {
        // Load .env file if present (ignore error if file doesn't exist)
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// [`Config::from_env`] delegates here with `std::env::var`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Config::from_env`].
    pub fn from_lookup<F>(lookup: F) -> IndexerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let rpc_url = lookup("RPC_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| IndexerError::config("RPC_URL environment variable is required", None))?;

        let contract_address = lookup("CONTRACT_ADDRESS").ok_or_else(|| {
            IndexerError::config("CONTRACT_ADDRESS environment variable is required", None)
        })?;
        let contract_address = validate_address(&contract_address)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let defaults = IndexerSettings::default();

        let start_block = parse_or(&lookup, "START_BLOCK", defaults.start_block)?;
        let poll_interval_secs =
            parse_or(&lookup, "POLL_INTERVAL_SECS", defaults.poll_interval.as_secs())?;
        let chunk_size = parse_or(&lookup, "CHUNK_SIZE_BLOCKS", defaults.chunk_size)?;
        let backoff_secs = parse_or(&lookup, "BACKOFF_SECS", defaults.backoff.as_secs())?;

        if chunk_size == 0 {
            return Err(IndexerError::config(
                "CHUNK_SIZE_BLOCKS must be greater than zero",
                None,
            ));
        }

        Ok(Self {
            rpc_url,
            contract_address,
            database_url,
            indexer: IndexerSettings {
                start_block,
                poll_interval: Duration::from_secs(poll_interval_secs),
                chunk_size,
                backoff: Duration::from_secs(backoff_secs),
            },
        })
    }

    /// Get the chain node RPC URL.
    #[must_use]
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    /// Get the indexed contract address.
    #[must_use]
    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Get the database connection string.
    #[must_use]
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Get the indexer loop settings.
    #[must_use]
    pub const fn indexer(&self) -> &IndexerSettings {
        &self.indexer
    }

    /// Mutable access for CLI overrides.
    pub fn indexer_mut(&mut self) -> &mut IndexerSettings {
        &mut self.indexer
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> IndexerResult<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            IndexerError::config(
                format!("{key} must be a valid number, got: {raw}"),
                Some(Box::new(e)),
            )
        }),
    }
}

fn validate_address(raw: &str) -> IndexerResult<String> {
    let trimmed = raw.trim();
    let valid = trimmed.len() == 42
        && trimmed.starts_with("0x")
        && trimmed[2..].chars().all(|c| c.is_ascii_hexdigit());

    if !valid {
        return Err(IndexerError::config(
            format!(
                "CONTRACT_ADDRESS must be a valid address (0x + 40 hex chars), got: {trimmed}"
            ),
            None,
        ));
    }

    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", CONTRACT),
        ]))
        .unwrap();

        assert_eq!(config.rpc_url(), "http://localhost:8545");
        assert_eq!(config.database_url(), DEFAULT_DATABASE_URL);
        assert_eq!(config.indexer(), &IndexerSettings::default());
        assert_eq!(config.indexer().chunk_size, 100);
        assert_eq!(config.indexer().backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_contract_address_is_lowercased() {
        let config = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", CONTRACT),
        ]))
        .unwrap();

        assert_eq!(
            config.contract_address(),
            "0x5fbdb2315678afecb367f032d93f642f64180aa3"
        );
    }

    #[test]
    fn test_missing_rpc_url() {
        let result = Config::from_lookup(lookup_from(&[("CONTRACT_ADDRESS", CONTRACT)]));
        assert!(matches!(result, Err(IndexerError::ConfigError { .. })));
    }

    #[test]
    fn test_invalid_contract_address() {
        let result = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", "0x1234"),
        ]));
        assert!(result.is_err());

        let result = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", "0xZZbDB2315678afecb367f032d93F642f64180aa3"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_and_validation() {
        let config = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", CONTRACT),
            ("START_BLOCK", "1200"),
            ("POLL_INTERVAL_SECS", "3"),
            ("CHUNK_SIZE_BLOCKS", "25"),
            ("BACKOFF_SECS", "30"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]))
        .unwrap();

        assert_eq!(config.indexer().start_block, 1200);
        assert_eq!(config.indexer().poll_interval, Duration::from_secs(3));
        assert_eq!(config.indexer().chunk_size, 25);
        assert_eq!(config.indexer().backoff, Duration::from_secs(30));
        assert_eq!(config.database_url(), "sqlite::memory:");
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let result = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", CONTRACT),
            ("CHUNK_SIZE_BLOCKS", "0"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_non_numeric_start_block() {
        let result = Config::from_lookup(lookup_from(&[
            ("RPC_URL", "http://localhost:8545"),
            ("CONTRACT_ADDRESS", CONTRACT),
            ("START_BLOCK", "latest"),
        ]));
        assert!(matches!(result, Err(IndexerError::ConfigError { .. })));
    }
}

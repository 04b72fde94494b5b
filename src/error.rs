//! Error types for the job registry indexer.
//!
//! This module provides a unified error type [`IndexerError`] covering every
//! failure the ingestion pipeline can surface to its caller.
//!
//! # Taxonomy
//!
//! - [`IndexerError::ConfigError`]: missing or malformed configuration
//! - [`IndexerError::RpcError`]: chain node unreachable, timed out, or returned garbage
//! - [`IndexerError::DecodingError`]: stored or fetched data that cannot be parsed
//! - [`IndexerError::DatabaseError`]: SQLite connection, query, or migration failures
//! - [`IndexerError::DuplicateKey`]: a raw event insert collided with an existing
//!   `(transaction_hash, event_index)` even though the existence check passed
//!
//! Data anomalies (an event that references a missing worker, a job in the
//! wrong state) are *not* errors: they are reported as
//! [`crate::projection::Anomaly`] and never abort a chunk.
//!
//! # Example
//!
//! ```
//! use job_registry_indexer::error::{IndexerError, IndexerResult};
//!
//! fn validate_chunk_size(chunk: u64) -> IndexerResult<()> {
//!     if chunk == 0 {
//!         return Err(IndexerError::config("CHUNK_SIZE_BLOCKS must be positive", None));
//!     }
//!     Ok(())
//! }
//! ```

use std::fmt;

/// Result type alias using [`IndexerError`].
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Boxed underlying cause carried by most variants.
pub type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Unified error type for the indexer.
#[derive(Debug)]
pub enum IndexerError {
    /// Configuration or environment variable errors.
    ConfigError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Chain node errors.
    ///
    /// Always treated as transient by the indexer loop.
    RpcError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Parsing errors for values read back from storage or from the chain.
    DecodingError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// Database operation errors.
    ///
    /// Variants include:
    /// - Connection failures
    /// - Query execution errors
    /// - Migration failures
    /// - Constraint violations other than the raw event natural key
    DatabaseError {
        /// Human-readable error message
        message: String,
        /// Optional underlying error
        source: Option<BoxedSource>,
    },

    /// A raw event with this natural key is already stored.
    ///
    /// Reaching this means the existence check and the insert disagreed,
    /// which points at a concurrent writer or a logic bug rather than bad
    /// chain data.
    DuplicateKey {
        /// Transaction hash of the colliding event
        transaction_hash: String,
        /// Index of the event inside its transaction
        event_index: u32,
    },
}

impl IndexerError {
    /// Create a new configuration error.
    ///
    /// # Example
    ///
    /// ```
    /// use job_registry_indexer::error::IndexerError;
    ///
    /// let err = IndexerError::config("RPC_URL not set", None);
    /// assert!(matches!(err, IndexerError::ConfigError { .. }));
    /// ```
    #[must_use]
    pub fn config(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::ConfigError {
            message: message.into(),
            source,
        }
    }

    /// Create a new RPC error.
    #[must_use]
    pub fn rpc(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::RpcError {
            message: message.into(),
            source,
        }
    }

    /// Create a new decoding error.
    #[must_use]
    pub fn decoding(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DecodingError {
            message: message.into(),
            source,
        }
    }

    /// Create a new database error.
    #[must_use]
    pub fn database(message: impl Into<String>, source: Option<BoxedSource>) -> Self {
        Self::DatabaseError {
            message: message.into(),
            source,
        }
    }

    /// Create a duplicate natural key error.
    #[must_use]
    pub fn duplicate_key(transaction_hash: impl Into<String>, event_index: u32) -> Self {
        Self::DuplicateKey {
            transaction_hash: transaction_hash.into(),
            event_index,
        }
    }

    /// Whether retrying the same work later can reasonably succeed.
    ///
    /// Configuration errors are permanent and end the indexer loop;
    /// everything else is retried after a backoff.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, Self::ConfigError { .. })
    }
}

impl fmt::Display for IndexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError { message, .. } => write!(f, "Configuration error: {message}"),
            Self::RpcError { message, .. } => write!(f, "RPC error: {message}"),
            Self::DecodingError { message, .. } => write!(f, "Decoding error: {message}"),
            Self::DatabaseError { message, .. } => write!(f, "Database error: {message}"),
            Self::DuplicateKey {
                transaction_hash,
                event_index,
            } => write!(
                f,
                "Duplicate event key: ({transaction_hash}, {event_index}) is already stored"
            ),
        }
    }
}

impl std::error::Error for IndexerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ConfigError { source, .. }
            | Self::RpcError { source, .. }
            | Self::DecodingError { source, .. }
            | Self::DatabaseError { source, .. } => source
                .as_ref()
                .map(|e| e.as_ref() as &dyn std::error::Error),
            Self::DuplicateKey { .. } => None,
        }
    }
}

/// Map a raw `sqlx` failure into [`IndexerError::DatabaseError`] with context.
///
/// Used as `.map_err(db_err("Failed to ..."))` at query call sites.
pub fn db_err(message: &'static str) -> impl FnOnce(sqlx::Error) -> IndexerError {
    move |e| IndexerError::database(message, Some(Box::new(e)))
}

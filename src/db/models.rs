//! Database models that map to SQL tables.
//!
//! Timestamps are unix seconds. 256-bit amounts are stored as decimal TEXT
//! and exposed through `*_u256` accessors.

use std::fmt;
use std::str::FromStr;

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::chain::RawChainEvent;
use crate::error::{IndexerError, IndexerResult};

/// Event name stored for logs that matched no known signature.
pub const UNKNOWN_EVENT_NAME: &str = "Unknown";

/// Lifecycle of a job as driven by chain events.
///
/// `open → assigned → completed`, or `open → cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created, waiting for a worker
    Open,
    /// Worker assigned, result pending
    Assigned,
    /// Result accepted
    Completed,
    /// Withdrawn before assignment
    Cancelled,
}

impl JobStatus {
    /// Column value for this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(IndexerError::decoding(
                format!("Unknown job status: {other}"),
                None,
            )),
        }
    }
}

/// Whether a raw event's natural key is already stored, and in what state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPresence {
    /// Never seen
    Absent,
    /// Stored but its projection never committed
    Unprocessed,
    /// Stored and projected
    Processed,
}

/// A row of `contract_events`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ContractEventRecord {
    /// Database-assigned unique identifier
    pub id: i64,
    /// Transaction hash (hex string with 0x prefix)
    pub transaction_hash: String,
    /// Block number where the event occurred
    pub block_number: i64,
    /// Index of the event; with the hash this is the natural key
    pub event_index: i64,
    /// Emitting contract
    pub contract_address: String,
    /// Decoded event name or [`UNKNOWN_EVENT_NAME`]
    pub event_name: String,
    /// JSON payload: decoded fields, or raw topics/data for unknown events
    pub event_data: String,
    /// Set once the projection for this event committed
    pub processed: bool,
    /// When `processed` flipped to true
    pub processed_at: Option<i64>,
    /// Unix timestamp when the row was inserted
    pub created_at: i64,
}

/// Insert payload for `contract_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContractEvent {
    /// Transaction hash
    pub transaction_hash: String,
    /// Block number
    pub block_number: i64,
    /// Event index
    pub event_index: u32,
    /// Emitting contract
    pub contract_address: String,
    /// Event name
    pub event_name: String,
    /// JSON payload
    pub event_data: String,
}

impl NewContractEvent {
    /// Pair a raw chain event with its stored name and JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the block number does not fit in an SQLite integer.
    pub fn from_raw(
        raw: &RawChainEvent,
        event_name: impl Into<String>,
        event_data: &serde_json::Value,
    ) -> IndexerResult<Self> {
        Ok(Self {
            transaction_hash: raw.tx_hash.clone(),
            block_number: to_db_int(raw.block_number, "block_number")?,
            event_index: raw.event_index,
            contract_address: raw.contract_address.to_ascii_lowercase(),
            event_name: event_name.into(),
            event_data: event_data.to_string(),
        })
    }
}

/// A row of `workers`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    /// Database-assigned unique identifier
    pub id: i64,
    /// Worker address, unique
    pub address: String,
    /// Content reference published at registration
    pub info_reference: Option<String>,
    /// Verified by a registry verifier
    pub verified: bool,
    /// Verifier address
    pub verified_by: Option<String>,
    /// When verification was observed
    pub verified_at: Option<i64>,
    /// Reputation in `[0, 1000]`
    pub reputation: i64,
    /// Completed job count
    pub jobs_completed: i64,
    /// Sum of completed job rewards (TEXT for U256 precision)
    pub total_earnings: String,
    /// When the worker row was created
    pub registered_at: i64,
    /// Last activity observed on chain
    pub last_seen: Option<i64>,
}

impl WorkerRecord {
    /// Converts `total_earnings` TEXT back to U256.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value is not a decimal integer.
    pub fn total_earnings_u256(&self) -> IndexerResult<U256> {
        parse_u256(&self.total_earnings, "total_earnings")
    }
}

/// A row of `jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    /// Database-assigned unique identifier
    pub id: i64,
    /// Job id assigned by the contract, unique
    pub chain_job_id: i64,
    /// Creator address
    pub creator_address: String,
    /// Input asset content reference
    pub asset_reference: String,
    /// Reward (TEXT for U256 precision)
    pub reward_amount: String,
    /// Unix deadline
    pub deadline: i64,
    /// Minimum reputation to take the job
    pub min_reputation: i64,
    /// Assigned worker
    pub worker_address: Option<String>,
    /// `open`, `assigned`, `completed` or `cancelled`
    pub status: String,
    /// Result content reference
    pub result_reference: Option<String>,
    /// Quality score given on completion
    pub quality_score: Option<i64>,
    /// When the job row was created
    pub created_at: i64,
    /// When the assignment was observed
    pub assigned_at: Option<i64>,
    /// When the completion was observed
    pub completed_at: Option<i64>,
}

impl JobRecord {
    /// Parsed status column.
    ///
    /// # Errors
    ///
    /// Returns an error for a value outside the four known statuses.
    pub fn status(&self) -> IndexerResult<JobStatus> {
        self.status.parse()
    }

    /// Converts `reward_amount` TEXT back to U256.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value is not a decimal integer.
    pub fn reward_u256(&self) -> IndexerResult<U256> {
        parse_u256(&self.reward_amount, "reward_amount")
    }
}

/// Insert payload for `jobs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    /// Contract job id
    pub chain_job_id: i64,
    /// Creator address
    pub creator_address: String,
    /// Input asset content reference
    pub asset_reference: String,
    /// Reward
    pub reward_amount: U256,
    /// Unix deadline
    pub deadline: i64,
    /// Minimum reputation
    pub min_reputation: i64,
}

/// A row of `job_events`, the per-job audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobEventRecord {
    /// Database-assigned unique identifier
    pub id: i64,
    /// Foreign key to `jobs.id`
    pub job_id: i64,
    /// `created`, `assigned`, `completed` or `cancelled`
    pub event_type: String,
    /// Transaction that caused the transition
    pub transaction_hash: String,
    /// Block of that transaction
    pub block_number: i64,
    /// Address that triggered the transition, when known
    pub actor_address: Option<String>,
    /// JSON details
    pub event_data: Option<String>,
    /// Unix timestamp when the row was inserted
    pub created_at: i64,
}

/// A row of `reputation_history`. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReputationHistoryRecord {
    /// Database-assigned unique identifier
    pub id: i64,
    /// Worker whose reputation changed
    pub worker_address: String,
    /// Reputation before
    pub old_reputation: i64,
    /// Reputation after
    pub new_reputation: i64,
    /// `new_reputation - old_reputation`
    pub change_amount: i64,
    /// Reason given by the contract
    pub reason: String,
    /// Job the change relates to, if any
    pub related_job_id: Option<i64>,
    /// Transaction that emitted the update
    pub transaction_hash: String,
    /// Unix timestamp when the row was inserted
    pub created_at: i64,
}

/// Aggregate over `contract_events` for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventCounts {
    /// All stored events
    pub total: i64,
    /// Events whose projection committed
    pub processed: i64,
    /// Events stored as [`UNKNOWN_EVENT_NAME`]
    pub unknown: i64,
}

/// Convert a chain quantity to an SQLite integer.
///
/// # Errors
///
/// Returns an error if the value exceeds `i64::MAX`.
pub fn to_db_int(value: u64, what: &str) -> IndexerResult<i64> {
    i64::try_from(value).map_err(|e| {
        IndexerError::decoding(
            format!("{what} {value} exceeds the storable range"),
            Some(Box::new(e)),
        )
    })
}

fn parse_u256(raw: &str, what: &str) -> IndexerResult<U256> {
    U256::from_str_radix(raw, 10).map_err(|e| {
        IndexerError::decoding(format!("Failed to parse {what}: {raw}"), Some(Box::new(e)))
    })
}

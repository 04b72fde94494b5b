//! Chain access for the indexer.
//!
//! The indexer never talks to a node directly; it goes through the
//! [`ChainClient`] trait, which is injected at construction time. The
//! production implementation is [`rpc::RpcChainClient`] (alloy over HTTP);
//! tests supply in-memory fakes.
//!
//! ```text
//! Indexer loop ──► ChainClient::latest_block / get_events   (fetch)
//!             ──► ChainClient::decode                       (pure)
//!             ──► ChainClient::get_job_info                 (hydration)
//! ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::IndexerResult;

pub mod contract;
pub mod rpc;

pub use rpc::RpcChainClient;

/// A log exactly as the node returned it, before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawChainEvent {
    /// Transaction hash (0x-prefixed hex)
    pub tx_hash: String,
    /// Block the log was emitted in
    pub block_number: u64,
    /// Position of the log; with `tx_hash` this is the natural key
    pub event_index: u32,
    /// Emitting contract (0x-prefixed hex)
    pub contract_address: String,
    /// Topics / keys, topic0 selects the event kind
    pub topics: Vec<String>,
    /// ABI-encoded non-indexed payload (0x-prefixed hex)
    pub data: String,
}

impl RawChainEvent {
    /// JSON rendering of the undecoded payload, stored for unknown events.
    #[must_use]
    pub fn raw_payload(&self) -> Value {
        serde_json::json!({
            "topics": self.topics,
            "data": self.data,
        })
    }

    /// Ordering key matching chain emission order.
    #[must_use]
    pub const fn position(&self) -> (u64, u32) {
        (self.block_number, self.event_index)
    }
}

/// A log that matched a known contract event signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    /// Event name, e.g. `JobCreated`
    pub event_name: String,
    /// Named fields; numbers above `u64` are carried as decimal strings
    pub fields: Map<String, Value>,
}

impl DecodedEvent {
    /// Build a decoded event from a name and a JSON object literal.
    ///
    /// Non-object values produce an empty field map.
    #[must_use]
    pub fn new(event_name: impl Into<String>, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            event_name: event_name.into(),
            fields,
        }
    }
}

/// The parts of the contract's `getJob` record that events do not carry.
///
/// Creator, reward and deadline come from the `JobCreated` event itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    /// Content reference of the input asset
    pub asset_reference: String,
    /// Minimum worker reputation required
    pub min_reputation: i64,
    /// Content reference of the submitted result
    pub result_reference: Option<String>,
}

/// Chain node operations the indexer depends on.
///
/// Every async method may fail transiently; the indexer treats such errors
/// as a reason to back off and retry the same block range.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current chain head.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::RpcError`](crate::error::IndexerError::RpcError)
    /// when the node cannot be reached.
    async fn latest_block(&self) -> IndexerResult<u64>;

    /// All contract logs in `from_block..=to_block`.
    ///
    /// # Arguments
    ///
    /// * `from_block` - first block, inclusive
    /// * `to_block` - last block, inclusive
    ///
    /// # Errors
    ///
    /// Returns an RPC error if the node rejects or times out the query. The
    /// caller retries the whole range.
    async fn get_events(&self, from_block: u64, to_block: u64)
        -> IndexerResult<Vec<RawChainEvent>>;

    /// Decode a raw log; `None` for payloads that match no known event.
    fn decode(&self, event: &RawChainEvent) -> Option<DecodedEvent>;

    /// Hydrate a job from contract storage; `Ok(None)` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an RPC error if the view call fails; the event and its chunk
    /// are then retried. A record that cannot be represented must come back
    /// as `Ok(None)` so the event is skipped instead.
    async fn get_job_info(&self, job_id: u64) -> IndexerResult<Option<JobMetadata>>;
}

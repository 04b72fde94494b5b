//! Alloy-backed [`ChainClient`] over HTTP JSON-RPC.
//!
//! ## Example
//!
//! ```no_run
//! use job_registry_indexer::chain::{ChainClient, RpcChainClient};
//! use job_registry_indexer::error::IndexerResult;
//!
//! # async fn example() -> IndexerResult<()> {
//! let client = RpcChainClient::connect(
//!     "http://localhost:8545",
//!     "0x5fbdb2315678afecb367f032d93f642f64180aa3",
//! )?;
//! let head = client.latest_block().await?;
//! let events = client.get_events(head.saturating_sub(100), head).await?;
//! println!("{} registry events in the last 100 blocks", events.len());
//! # Ok(())
//! # }
//! ```

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider as _, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::contract::{self, IJobRegistry};
use super::{ChainClient, DecodedEvent, JobMetadata, RawChainEvent};
use crate::error::{IndexerError, IndexerResult};

/// HTTP provider type used by the client.
pub type Provider = RootProvider<Http<Client>>;

/// Production chain client for the job registry contract.
#[derive(Clone)]
pub struct RpcChainClient {
    provider: Provider,
    contract_address: Address,
}

impl RpcChainClient {
    /// Build an HTTP provider for `rpc_url` bound to the registry at `contract_address`.
    ///
    /// No request is made here; connectivity problems surface on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL or the address cannot be parsed.
    pub fn connect(rpc_url: &str, contract_address: &str) -> IndexerResult<Self> {
        info!("Initializing RPC provider");
        debug!(rpc_url, "RPC endpoint");

        let url = rpc_url
            .parse()
            .map_err(|e| IndexerError::rpc("Failed to parse RPC URL", Some(Box::new(e))))?;

        let contract_address = contract_address.parse::<Address>().map_err(|e| {
            IndexerError::config(
                format!("Invalid contract address: {contract_address}"),
                Some(Box::new(e)),
            )
        })?;

        let provider = ProviderBuilder::new().on_http(url);

        info!(contract = %contract_address, "RPC provider initialized");

        Ok(Self {
            provider,
            contract_address,
        })
    }

    /// Convert an RPC log into the indexer's raw event form.
    ///
    /// Logs without a transaction hash, block number or index (pending logs)
    /// are dropped.
    fn to_raw(log: &Log) -> Option<RawChainEvent> {
        let tx_hash = log.transaction_hash?;
        let block_number = log.block_number?;
        let event_index = u32::try_from(log.log_index?).ok()?;

        Some(RawChainEvent {
            tx_hash: tx_hash.to_string(),
            block_number,
            event_index,
            contract_address: contract::address_hex(log.address()),
            topics: log.topics().iter().map(ToString::to_string).collect(),
            data: log.data().data.to_string(),
        })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn latest_block(&self) -> IndexerResult<u64> {
        let block_number = self.provider.get_block_number().await.map_err(|e| {
            IndexerError::rpc("Failed to fetch latest block number", Some(Box::new(e)))
        })?;

        debug!(block_number, "Fetched chain head");
        Ok(block_number)
    }

    #[instrument(skip(self))]
    async fn get_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> IndexerResult<Vec<RawChainEvent>> {
        let filter = Filter::new()
            .address(self.contract_address)
            .from_block(from_block)
            .to_block(to_block);

        let logs = self.provider.get_logs(&filter).await.map_err(|e| {
            IndexerError::rpc(
                format!("Failed to fetch logs for blocks {from_block}..={to_block}"),
                Some(Box::new(e)),
            )
        })?;

        let fetched = logs.len();
        let events: Vec<RawChainEvent> = logs.iter().filter_map(Self::to_raw).collect();
        if events.len() != fetched {
            warn!(
                fetched,
                kept = events.len(),
                "Dropped logs without block position"
            );
        }

        debug!(count = events.len(), "Fetched registry logs");
        Ok(events)
    }

    fn decode(&self, event: &RawChainEvent) -> Option<DecodedEvent> {
        contract::decode_log(event)
    }

    #[instrument(skip(self))]
    async fn get_job_info(&self, job_id: u64) -> IndexerResult<Option<JobMetadata>> {
        let registry = IJobRegistry::new(self.contract_address, &self.provider);

        let IJobRegistry::getJobReturn { job } = registry
            .getJob(U256::from(job_id))
            .call()
            .await
            .map_err(|e| {
                IndexerError::rpc(format!("getJob({job_id}) failed"), Some(Box::new(e)))
            })?;

        // Unknown ids read back as a zeroed struct.
        if job.creator == Address::ZERO {
            return Ok(None);
        }

        Ok(Some(JobMetadata {
            asset_reference: job.assetCid,
            min_reputation: i64::from(job.minReputation),
            result_reference: (!job.resultCid.is_empty()).then_some(job.resultCid),
        }))
    }
}

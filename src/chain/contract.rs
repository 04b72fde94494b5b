//! Job registry contract bindings and log decoding.
//!
//! The `sol!` macro generates typed event structs and the `getJob` call
//! binding from Solidity signatures, so topic hashes and ABI layouts are
//! checked at compile time.
//!
//! [`decode_log`] turns a [`RawChainEvent`] into a [`DecodedEvent`] with
//! named JSON fields. 256-bit integers become decimal strings and addresses
//! become lowercase `0x` hex; the projection layer parses them back.

use std::str::FromStr;

use alloy::primitives::{Address, Bytes, LogData, B256};
use alloy::sol;
use alloy::sol_types::SolEvent;
use serde_json::json;

use super::{DecodedEvent, RawChainEvent};

sol! {
    #[sol(rpc)]
    interface IJobRegistry {
        /// Storage layout returned by `getJob`.
        struct JobInfo {
            address creator;
            string assetCid;
            uint256 reward;
            uint64 deadline;
            uint16 minReputation;
            address worker;
            bool completed;
            string resultCid;
            uint8 qualityScore;
        }

        event WorkerRegistered(address indexed worker, string infoCid);
        event WorkerVerified(address indexed worker, address indexed verifier);
        event JobCreated(uint256 indexed jobId, address indexed creator, uint256 reward, uint64 deadline);
        event JobAssigned(uint256 indexed jobId, address indexed worker);
        event JobCompleted(uint256 indexed jobId, uint8 qualityScore);
        event JobCancelled(uint256 indexed jobId);
        event ReputationUpdated(address indexed worker, uint256 oldReputation, uint256 newReputation, string reason);

        function getJob(uint256 jobId) external view returns (JobInfo memory job);
    }
}

pub use IJobRegistry::{
    JobAssigned, JobCancelled, JobCompleted, JobCreated, ReputationUpdated, WorkerRegistered,
    WorkerVerified,
};

/// Render an address the way it is stored: lowercase, 0x-prefixed.
#[must_use]
pub fn address_hex(address: Address) -> String {
    address.to_string().to_ascii_lowercase()
}

/// Rebuild alloy `LogData` from the string form kept in [`RawChainEvent`].
fn log_data(event: &RawChainEvent) -> Option<LogData> {
    let topics = event
        .topics
        .iter()
        .map(|t| B256::from_str(t))
        .collect::<Result<Vec<_>, _>>()
        .ok()?;
    let data = Bytes::from_str(&event.data).ok()?;
    Some(LogData::new_unchecked(topics, data))
}

/// Decode a registry log by its topic0.
///
/// Returns `None` when the signature is unknown or the payload does not
/// match the ABI of the event it claims to be.
#[must_use]
pub fn decode_log(event: &RawChainEvent) -> Option<DecodedEvent> {
    let data = log_data(event)?;
    let topic0 = *data.topics().first()?;

    if topic0 == WorkerRegistered::SIGNATURE_HASH {
        let e = WorkerRegistered::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "WorkerRegistered",
            json!({ "worker": address_hex(e.worker), "info_cid": e.infoCid }),
        ))
    } else if topic0 == WorkerVerified::SIGNATURE_HASH {
        let e = WorkerVerified::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "WorkerVerified",
            json!({ "worker": address_hex(e.worker), "verifier": address_hex(e.verifier) }),
        ))
    } else if topic0 == JobCreated::SIGNATURE_HASH {
        let e = JobCreated::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "JobCreated",
            json!({
                "job_id": e.jobId.to_string(),
                "creator": address_hex(e.creator),
                "reward": e.reward.to_string(),
                "deadline": e.deadline,
            }),
        ))
    } else if topic0 == JobAssigned::SIGNATURE_HASH {
        let e = JobAssigned::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "JobAssigned",
            json!({ "job_id": e.jobId.to_string(), "worker": address_hex(e.worker) }),
        ))
    } else if topic0 == JobCompleted::SIGNATURE_HASH {
        let e = JobCompleted::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "JobCompleted",
            json!({ "job_id": e.jobId.to_string(), "quality_score": e.qualityScore }),
        ))
    } else if topic0 == JobCancelled::SIGNATURE_HASH {
        let e = JobCancelled::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "JobCancelled",
            json!({ "job_id": e.jobId.to_string() }),
        ))
    } else if topic0 == ReputationUpdated::SIGNATURE_HASH {
        let e = ReputationUpdated::decode_log_data(&data, true).ok()?;
        Some(DecodedEvent::new(
            "ReputationUpdated",
            json!({
                "worker": address_hex(e.worker),
                "old_reputation": e.oldReputation.to_string(),
                "new_reputation": e.newReputation.to_string(),
                "reason": e.reason,
            }),
        ))
    } else {
        None
    }
}

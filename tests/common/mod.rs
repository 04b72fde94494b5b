//! Shared fixtures: an in-memory chain and database helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use job_registry_indexer::chain::{ChainClient, DecodedEvent, JobMetadata, RawChainEvent};
use job_registry_indexer::config::IndexerSettings;
use job_registry_indexer::db::{create_pool, Repository};
use job_registry_indexer::error::{IndexerError, IndexerResult};
use job_registry_indexer::indexer::Indexer;
use serde_json::json;
use tokio::sync::Notify;

pub const CONTRACT: &str = "0x5fbdb2315678afecb367f032d93f642f64180aa3";
pub const CREATOR: &str = "0x00000000000000000000000000000000000000aa";
pub const WORKER: &str = "0x00000000000000000000000000000000000000bb";
pub const OTHER_WORKER: &str = "0x00000000000000000000000000000000000000cc";
pub const VERIFIER: &str = "0x00000000000000000000000000000000000000dd";

#[derive(Default)]
struct FakeState {
    head: u64,
    events: Vec<RawChainEvent>,
    decoded: HashMap<(String, u32), DecodedEvent>,
    jobs: HashMap<u64, JobMetadata>,
    fail_latest: usize,
    fail_get_events: usize,
    fail_job_info: usize,
    misconfigured: bool,
    hold_job_info: bool,
    latest_calls: usize,
    get_events_calls: Vec<(u64, u64)>,
    job_info_calls: Vec<u64>,
}

/// Scriptable [`ChainClient`]: events, head and failures are set by the test.
#[derive(Default)]
pub struct FakeChain {
    state: Mutex<FakeState>,
    release: Notify,
}

pub fn tx_hash(block: u64, index: u32) -> String {
    format!("0x{block:032x}{index:032x}")
}

impl FakeChain {
    pub fn new(head: u64) -> Arc<Self> {
        let chain = Self::default();
        chain.state.lock().unwrap().head = head;
        Arc::new(chain)
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    /// Add a log at `(block, index)`. `decoded: None` makes it undecodable.
    pub fn push(&self, block: u64, index: u32, decoded: Option<DecodedEvent>) -> RawChainEvent {
        let raw = RawChainEvent {
            tx_hash: tx_hash(block, index),
            block_number: block,
            event_index: index,
            contract_address: CONTRACT.to_string(),
            topics: vec![format!("0x{:064x}", u64::from(index) + 1)],
            data: format!("0x{block:064x}"),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(decoded) = decoded {
            state
                .decoded
                .insert((raw.tx_hash.clone(), index), decoded);
        }
        state.events.push(raw.clone());
        raw
    }

    pub fn set_job(&self, job_id: u64, metadata: JobMetadata) {
        self.state.lock().unwrap().jobs.insert(job_id, metadata);
    }

    pub fn fail_latest(&self, times: usize) {
        self.state.lock().unwrap().fail_latest = times;
    }

    pub fn fail_get_events(&self, times: usize) {
        self.state.lock().unwrap().fail_get_events = times;
    }

    pub fn fail_job_info(&self, times: usize) {
        self.state.lock().unwrap().fail_job_info = times;
    }

    /// Make `latest_block` fail with a configuration error from now on.
    pub fn misconfigure(&self) {
        self.state.lock().unwrap().misconfigured = true;
    }

    /// Park every `get_job_info` call until [`FakeChain::release_job_info`].
    pub fn hold_job_info(&self) {
        self.state.lock().unwrap().hold_job_info = true;
    }

    pub fn release_job_info(&self) {
        self.state.lock().unwrap().hold_job_info = false;
        self.release.notify_one();
    }

    pub fn latest_calls(&self) -> usize {
        self.state.lock().unwrap().latest_calls
    }

    pub fn get_events_calls(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().get_events_calls.clone()
    }

    pub fn job_info_calls(&self) -> Vec<u64> {
        self.state.lock().unwrap().job_info_calls.clone()
    }

    pub fn events(&self) -> Vec<RawChainEvent> {
        self.state.lock().unwrap().events.clone()
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn latest_block(&self) -> IndexerResult<u64> {
        let mut state = self.state.lock().unwrap();
        state.latest_calls += 1;
        if state.misconfigured {
            return Err(IndexerError::config("chain id mismatch", None));
        }
        if state.fail_latest > 0 {
            state.fail_latest -= 1;
            return Err(IndexerError::rpc("connection refused", None));
        }
        Ok(state.head)
    }

    async fn get_events(&self, from_block: u64, to_block: u64) -> IndexerResult<Vec<RawChainEvent>> {
        let mut state = self.state.lock().unwrap();
        state.get_events_calls.push((from_block, to_block));
        if state.fail_get_events > 0 {
            state.fail_get_events -= 1;
            return Err(IndexerError::rpc("getLogs timed out", None));
        }
        // Insertion order, not chain order: the indexer must sort.
        Ok(state
            .events
            .iter()
            .filter(|e| (from_block..=to_block).contains(&e.block_number))
            .cloned()
            .collect())
    }

    fn decode(&self, event: &RawChainEvent) -> Option<DecodedEvent> {
        self.state
            .lock()
            .unwrap()
            .decoded
            .get(&(event.tx_hash.clone(), event.event_index))
            .cloned()
    }

    async fn get_job_info(&self, job_id: u64) -> IndexerResult<Option<JobMetadata>> {
        let held = {
            let mut state = self.state.lock().unwrap();
            state.job_info_calls.push(job_id);
            state.hold_job_info
        };
        if held {
            self.release.notified().await;
        }

        let mut state = self.state.lock().unwrap();
        if state.fail_job_info > 0 {
            state.fail_job_info -= 1;
            return Err(IndexerError::rpc("eth_call failed", None));
        }
        Ok(state.jobs.get(&job_id).cloned())
    }
}

pub fn job_metadata() -> JobMetadata {
    JobMetadata {
        asset_reference: "bafy-scene".to_string(),
        min_reputation: 400,
        result_reference: Some("bafy-render".to_string()),
    }
}

pub fn worker_registered(worker: &str) -> DecodedEvent {
    DecodedEvent::new(
        "WorkerRegistered",
        json!({ "worker": worker, "info_cid": "bafy-profile" }),
    )
}

pub fn worker_verified(worker: &str) -> DecodedEvent {
    DecodedEvent::new(
        "WorkerVerified",
        json!({ "worker": worker, "verifier": VERIFIER }),
    )
}

pub fn job_created(job_id: u64, reward: u64) -> DecodedEvent {
    DecodedEvent::new(
        "JobCreated",
        json!({
            "job_id": job_id.to_string(),
            "creator": CREATOR,
            "reward": reward.to_string(),
            "deadline": 1_900_000_000u64,
        }),
    )
}

pub fn job_assigned(job_id: u64, worker: &str) -> DecodedEvent {
    DecodedEvent::new(
        "JobAssigned",
        json!({ "job_id": job_id.to_string(), "worker": worker }),
    )
}

pub fn job_completed(job_id: u64, quality_score: u64) -> DecodedEvent {
    DecodedEvent::new(
        "JobCompleted",
        json!({ "job_id": job_id.to_string(), "quality_score": quality_score }),
    )
}

pub fn reputation_updated(worker: &str, old: u64, new: u64, reason: &str) -> DecodedEvent {
    DecodedEvent::new(
        "ReputationUpdated",
        json!({
            "worker": worker,
            "old_reputation": old.to_string(),
            "new_reputation": new.to_string(),
            "reason": reason,
        }),
    )
}

pub fn settings(start_block: u64) -> IndexerSettings {
    IndexerSettings {
        start_block,
        poll_interval: Duration::from_millis(20),
        chunk_size: 100,
        backoff: Duration::from_millis(20),
    }
}

pub async fn memory_repository() -> Repository {
    Repository::new(
        create_pool("sqlite::memory:")
            .await
            .expect("Failed to create test pool"),
    )
}

pub async fn file_repository(path: &Path) -> Repository {
    let url = format!("sqlite:{}", path.display());
    Repository::new(create_pool(&url).await.expect("Failed to open test database"))
}

pub fn init_log() {
    job_registry_indexer::observability::init_test_tracing();
}

pub fn indexer(repository: &Repository, chain: &Arc<FakeChain>, start_block: u64) -> Indexer {
    Indexer::new(repository.clone(), chain.clone(), settings(start_block))
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

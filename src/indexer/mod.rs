//! Indexer Loop: checkpoint recovery, chunked polling, ingestion and backoff.
//!
//! ```text
//! Stopped ──start()──► Recovering ──► Polling ⇄ Backoff
//!    ▲                                   │
//!    └──────────────stop()───────────────┘
//! ```
//!
//! One pass over the chain:
//!
//! 1. Fetch the head; nothing to do if it is below the next block.
//! 2. Split `next..=head` into chunks of `chunk_size` blocks.
//! 3. For each chunk, fetch its events, sort them by
//!    `(block_number, event_index)` and ingest them one by one.
//! 4. Save the checkpoint once every event of the chunk is committed.
//!
//! Each event is ingested in its own [`UnitOfWork`]: raw insert, projection
//! and `processed` flag commit together. A failure anywhere aborts the chunk,
//! the loop backs off, and the same chunk is fetched again; events already
//! committed are recognized by their natural key and skipped.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::{ChainClient, JobMetadata, RawChainEvent};
use crate::config::IndexerSettings;
use crate::db::models::{EventPresence, NewContractEvent, UNKNOWN_EVENT_NAME};
use crate::db::Repository;
use crate::error::{IndexerError, IndexerResult};
use crate::projection::{self, Anomaly, EventContext, FieldError, Outcome, RegistryEvent};

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Not running
    Stopped,
    /// Working out where to resume
    Recovering,
    /// Fetching and ingesting, or waiting for new blocks
    Polling,
    /// Waiting after a failure
    Backoff,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Recovering => write!(f, "recovering"),
            Self::Polling => write!(f, "polling"),
            Self::Backoff => write!(f, "backoff"),
        }
    }
}

/// Snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexerStatus {
    /// Current phase
    pub phase: Phase,
    /// Whether the background loop is alive
    pub running: bool,
    /// Highest block known to be fully ingested
    pub last_processed_block: Option<u64>,
    /// Head seen on the most recent poll
    pub chain_head: Option<u64>,
    /// Events committed by this instance
    pub events_ingested: u64,
    /// Events skipped as data anomalies
    pub anomalies: u64,
    /// Natural key collisions the presence check did not catch
    pub duplicate_keys: u64,
    /// Chunks completed
    pub chunks: u64,
    /// Most recent failure, cleared by the next completed chunk
    pub last_error: Option<String>,
}

impl Default for IndexerStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Stopped,
            running: false,
            last_processed_block: None,
            chain_head: None,
            events_ingested: 0,
            anomalies: 0,
            duplicate_keys: 0,
            chunks: 0,
            last_error: None,
        }
    }
}

/// What happened to one raw event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingest {
    /// Already stored and projected; nothing written
    AlreadyProcessed,
    /// Stored (or re-projected) and marked processed
    Committed(Outcome),
}

/// Per-chunk tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkReport {
    /// First block of the chunk
    pub from_block: u64,
    /// Last block of the chunk
    pub to_block: u64,
    /// Events returned by the chain client
    pub fetched: usize,
    /// Events committed in this pass
    pub committed: usize,
    /// Events skipped because they were already processed
    pub already_processed: usize,
    /// Committed events whose projection was skipped
    pub anomalies: usize,
    /// Duplicate key collisions
    pub duplicate_keys: usize,
    /// Stop was requested before the chunk finished
    pub interrupted: bool,
}

/// Result of [`Indexer::catch_up`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// First block this pass looked at
    pub start_block: u64,
    /// Highest fully ingested block afterwards
    pub last_processed_block: Option<u64>,
    /// Head the pass caught up to
    pub chain_head: Option<u64>,
}

enum Parsed {
    Undecodable,
    Malformed(String, FieldError),
    Event(RegistryEvent),
}

struct Running {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Inner {
    repository: Repository,
    chain: Arc<dyn ChainClient>,
    settings: IndexerSettings,
    status: Mutex<IndexerStatus>,
}

/// The ingestion loop for one contract.
///
/// Construct one per process and hand it whatever owns the lifecycle.
///
/// ```no_run
/// use std::sync::Arc;
/// use job_registry_indexer::{chain::RpcChainClient, config::Config, db, indexer::Indexer};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::from_env()?;
/// let repository = db::Repository::new(db::create_pool(config.database_url()).await?);
/// let chain = Arc::new(RpcChainClient::connect(config.rpc_url(), config.contract_address())?);
///
/// let indexer = Indexer::new(repository, chain, config.indexer().clone());
/// indexer.start();
/// tokio::signal::ctrl_c().await?;
/// indexer.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Indexer {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn stop_requested(stop: Option<&watch::Receiver<bool>>) -> bool {
    stop.is_some_and(|rx| *rx.borrow())
}

/// Sleep for `delay`. Returns true if a stop was requested meanwhile.
async fn pause(stop: &mut watch::Receiver<bool>, delay: std::time::Duration) -> bool {
    if *stop.borrow() {
        return true;
    }
    tokio::select! {
        () = tokio::time::sleep(delay) => *stop.borrow(),
        changed = stop.changed() => changed.is_err() || *stop.borrow(),
    }
}

impl Indexer {
    /// Create a stopped indexer.
    #[must_use]
    pub fn new(
        repository: Repository,
        chain: Arc<dyn ChainClient>,
        settings: IndexerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repository,
                chain,
                settings,
                status: Mutex::new(IndexerStatus::default()),
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the background loop. No-op if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            debug!("Indexer already running");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run(stop_rx));
        *running = Some(Running { stop_tx, task });
        info!("Indexer started");
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// The event being ingested when the request arrives is finished first,
    /// so no transaction is abandoned halfway.
    pub async fn stop(&self) {
        let Some(running) = lock(&self.running).take() else {
            debug!("Indexer not running");
            return;
        };

        info!("Stopping indexer");
        // Err only means the loop already exited.
        let _ = running.stop_tx.send(true);
        if let Err(e) = running.task.await {
            error!(error = %e, "Indexer task ended abnormally");
        }
        self.inner.set_phase(Phase::Stopped);
        info!("Indexer stopped");
    }

    /// Whether the background loop is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.running)
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> IndexerStatus {
        let mut status = lock(&self.inner.status).clone();
        status.running = self.is_running();
        status
    }

    /// Recover, then ingest up to the current head once, in the caller's task.
    ///
    /// # Errors
    ///
    /// Fails if the background loop is running (two loops must never share a
    /// checkpoint), or with the first chain or storage error. Chunks
    /// completed before the error stay committed.
    ///
    /// A chunk that hit a duplicate key ends the pass early without an
    /// error; `last_processed_block` then stays below the head.
    pub async fn catch_up(&self) -> IndexerResult<SyncReport> {
        if self.is_running() {
            return Err(IndexerError::config(
                "catch_up called while the indexer loop is running",
                None,
            ));
        }

        let inner = &self.inner;
        let result = async {
            let mut next = inner.recover().await?;
            let start_block = next;
            inner.sync_to_head(&mut next, None).await?;
            Ok::<_, IndexerError>(start_block)
        }
        .await;

        if let Err(e) = &result {
            inner.record_error(e);
        }
        inner.set_phase(Phase::Stopped);

        let start_block = result?;
        let status = self.status();
        Ok(SyncReport {
            start_block,
            last_processed_block: status.last_processed_block,
            chain_head: status.chain_head,
        })
    }

    /// Ingest one raw event outside the loop. Exposed for tools and tests.
    ///
    /// # Errors
    ///
    /// Returns chain (hydration) or storage errors; the event is then left
    /// exactly as it was.
    pub async fn ingest(&self, raw: &RawChainEvent) -> IndexerResult<Ingest> {
        self.inner.ingest(raw).await
    }
}

impl Inner {
    fn update(&self, f: impl FnOnce(&mut IndexerStatus)) {
        f(&mut *lock(&self.status));
    }

    fn set_phase(&self, phase: Phase) {
        self.update(|s| s.phase = phase);
    }

    fn record_error(&self, e: &IndexerError) {
        let message = e.to_string();
        self.update(|s| s.last_error = Some(message));
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            start_block = self.settings.start_block,
            chunk_size = self.settings.chunk_size,
            poll_interval_secs = self.settings.poll_interval.as_secs(),
            backoff_secs = self.settings.backoff.as_secs(),
            "Indexer loop running"
        );

        let mut next_block: Option<u64> = None;

        loop {
            if *stop.borrow() {
                break;
            }

            let result = match next_block {
                Some(ref mut next) => self.sync_to_head(next, Some(&stop)).await,
                None => match self.recover().await {
                    Ok(next) => {
                        next_block = Some(next);
                        continue;
                    }
                    Err(e) => Err(e),
                },
            };

            let delay = match result {
                Ok(()) => self.settings.poll_interval,
                Err(e) if !e.is_transient() => {
                    error!(error = %e, "Permanent failure, indexer loop exiting");
                    self.record_error(&e);
                    break;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        backoff_secs = self.settings.backoff.as_secs(),
                        "Ingestion failed, backing off"
                    );
                    self.record_error(&e);
                    self.set_phase(Phase::Backoff);
                    self.settings.backoff
                }
            };

            if pause(&mut stop, delay).await {
                break;
            }
        }

        self.set_phase(Phase::Stopped);
        info!("Indexer loop exited");
    }

    /// Decide the first block to fetch.
    ///
    /// Saved checkpoint + 1; otherwise the highest stored event's block
    /// (re-scanned, dedupe makes that safe); otherwise `start_block`.
    #[instrument(skip(self))]
    async fn recover(&self) -> IndexerResult<u64> {
        self.set_phase(Phase::Recovering);

        let (next, last_processed) = if let Some(checkpoint) =
            self.repository.load_checkpoint().await?
        {
            info!(checkpoint, "Resuming after saved checkpoint");
            (checkpoint.saturating_add(1), Some(checkpoint))
        } else if let Some(max_block) = self.repository.max_block().await? {
            info!(max_block, "No checkpoint, resuming from highest stored event");
            (max_block, max_block.checked_sub(1))
        } else {
            info!(
                start_block = self.settings.start_block,
                "Empty store, starting from configured block"
            );
            (self.settings.start_block, None)
        };

        self.update(|s| s.last_processed_block = last_processed);
        Ok(next)
    }

    /// Ingest chunks from `*next` up to the current head.
    ///
    /// `*next` only moves past a chunk after its checkpoint is saved. A chunk
    /// interrupted by stop, or with a duplicate key, is fetched again on the
    /// next pass.
    async fn sync_to_head(
        &self,
        next: &mut u64,
        stop: Option<&watch::Receiver<bool>>,
    ) -> IndexerResult<()> {
        self.set_phase(Phase::Polling);

        let head = self.chain.latest_block().await?;
        self.update(|s| s.chain_head = Some(head));

        if head < *next {
            debug!(head, next = *next, "No new blocks");
            return Ok(());
        }

        let chunk_size = self.settings.chunk_size.max(1);
        while *next <= head {
            if stop_requested(stop) {
                return Ok(());
            }

            let to_block = next.saturating_add(chunk_size - 1).min(head);
            let report = self.process_chunk(*next, to_block, stop).await?;
            if report.interrupted {
                info!(
                    from_block = report.from_block,
                    committed = report.committed,
                    "Stop requested mid-chunk; checkpoint not advanced"
                );
                return Ok(());
            }
            if report.duplicate_keys > 0 {
                warn!(
                    from_block = report.from_block,
                    to_block = report.to_block,
                    duplicate_keys = report.duplicate_keys,
                    "Chunk left for the next pass; checkpoint not advanced"
                );
                // Later events of this chunk are stored, so a restart must not
                // fall back to the highest stored block.
                if let Some(previous) = report.from_block.checked_sub(1) {
                    self.repository.save_checkpoint(previous).await?;
                }
                return Ok(());
            }

            self.repository.save_checkpoint(to_block).await?;
            self.update(|s| {
                s.last_processed_block = Some(to_block);
                s.chunks += 1;
                s.last_error = None;
            });

            match to_block.checked_add(1) {
                Some(n) => *next = n,
                None => break,
            }
        }

        Ok(())
    }

    #[instrument(skip(self, stop), fields(fetched = tracing::field::Empty))]
    async fn process_chunk(
        &self,
        from_block: u64,
        to_block: u64,
        stop: Option<&watch::Receiver<bool>>,
    ) -> IndexerResult<ChunkReport> {
        let mut events = self.chain.get_events(from_block, to_block).await?;
        events.sort_by_key(RawChainEvent::position);
        tracing::Span::current().record("fetched", events.len());

        let mut report = ChunkReport {
            from_block,
            to_block,
            fetched: events.len(),
            ..ChunkReport::default()
        };

        for raw in &events {
            if stop_requested(stop) {
                report.interrupted = true;
                break;
            }

            match self.ingest(raw).await {
                Ok(Ingest::AlreadyProcessed) => report.already_processed += 1,
                Ok(Ingest::Committed(outcome)) => {
                    report.committed += 1;
                    if matches!(outcome, Outcome::Skipped(_)) {
                        report.anomalies += 1;
                    }
                }
                Err(IndexerError::DuplicateKey {
                    transaction_hash,
                    event_index,
                }) => {
                    warn!(
                        transaction_hash = %transaction_hash,
                        event_index,
                        "Duplicate event key despite presence check; skipping"
                    );
                    report.duplicate_keys += 1;
                    self.update(|s| s.duplicate_keys += 1);
                }
                Err(e) => return Err(e),
            }
        }

        if report.fetched > 0 {
            info!(
                from_block,
                to_block,
                fetched = report.fetched,
                committed = report.committed,
                already_processed = report.already_processed,
                anomalies = report.anomalies,
                "Chunk ingested"
            );
        } else {
            debug!(from_block, to_block, "Empty chunk");
        }

        Ok(report)
    }

    #[instrument(
        skip(self, raw),
        fields(tx = %raw.tx_hash, index = raw.event_index, block = raw.block_number)
    )]
    async fn ingest(&self, raw: &RawChainEvent) -> IndexerResult<Ingest> {
        let tx_hash = raw.tx_hash.as_str();

        if self.repository.event_presence(tx_hash, raw.event_index).await?
            == EventPresence::Processed
        {
            debug!("Event already processed");
            return Ok(Ingest::AlreadyProcessed);
        }

        let (event_name, event_data, parsed) = match self.chain.decode(raw) {
            None => (
                UNKNOWN_EVENT_NAME.to_string(),
                raw.raw_payload(),
                Parsed::Undecodable,
            ),
            Some(decoded) => {
                let parsed = match RegistryEvent::parse(&decoded) {
                    Ok(event) => Parsed::Event(event),
                    Err(e) => Parsed::Malformed(decoded.event_name.clone(), e),
                };
                (decoded.event_name, Value::Object(decoded.fields), parsed)
            }
        };

        // Chain reads happen before the transaction opens.
        let metadata = match &parsed {
            Parsed::Event(event) => self.hydrate(event).await?,
            _ => None,
        };

        let mut uow = self.repository.begin().await?;
        match uow.event_presence(tx_hash, raw.event_index).await? {
            EventPresence::Processed => return Ok(Ingest::AlreadyProcessed),
            EventPresence::Unprocessed => debug!("Re-projecting stored event"),
            EventPresence::Absent => {
                let record = NewContractEvent::from_raw(raw, &event_name, &event_data)?;
                uow.insert_event(&record).await?;
            }
        }

        let outcome = match &parsed {
            Parsed::Undecodable => Outcome::Ignored,
            Parsed::Malformed(name, e) => Outcome::Skipped(Anomaly::MalformedPayload {
                event_name: name.clone(),
                reason: e.to_string(),
            }),
            Parsed::Event(event) => {
                let ctx = EventContext {
                    transaction_hash: tx_hash,
                    block_number: raw.block_number,
                };
                projection::apply(&mut uow, event, ctx, metadata.as_ref()).await?
            }
        };

        uow.mark_processed(tx_hash, raw.event_index).await?;
        uow.commit().await?;

        match &outcome {
            Outcome::Skipped(anomaly) => {
                warn!(event_name = %event_name, anomaly = %anomaly, "Event skipped: data anomaly");
                self.update(|s| s.anomalies += 1);
            }
            Outcome::Ignored if matches!(parsed, Parsed::Undecodable) => {
                warn!("Stored undecodable event");
            }
            Outcome::Ignored => debug!(event_name = %event_name, "Stored event without projection"),
            Outcome::Applied | Outcome::Unchanged => {
                debug!(event_name = %event_name, ?outcome, "Event projected");
            }
        }
        self.update(|s| s.events_ingested += 1);

        Ok(Ingest::Committed(outcome))
    }

    /// Fetch the on-chain job record an event needs, if any.
    async fn hydrate(
        &self,
        event: &RegistryEvent,
    ) -> IndexerResult<Option<JobMetadata>> {
        let Some(job_id) = event.hydration_target() else {
            return Ok(None);
        };

        // A creation that is already projected needs no metadata.
        if matches!(event, RegistryEvent::JobCreated { .. })
            && self.repository.get_job(job_id).await?.is_some()
        {
            return Ok(None);
        }

        let metadata = self.chain.get_job_info(job_id).await?;
        if metadata.is_none() {
            debug!(job_id, "Contract has no record for job");
        }
        Ok(metadata)
    }
}

//! Projection Engine: turns registry events into workers, jobs and
//! reputation history.
//!
//! [`apply`] matches exhaustively over [`RegistryEvent`]. Each handler runs
//! inside the caller's [`UnitOfWork`], so its writes commit together with
//! the raw event and its `processed` flag, or not at all.
//!
//! Handlers never fail on bad data. A precondition that does not hold (the
//! worker is unknown, the job is in the wrong state) produces
//! [`Outcome::Skipped`] with an [`Anomaly`]; only storage failures surface
//! as errors.

use std::fmt;

use alloy::primitives::U256;
use serde_json::json;
use tracing::{debug, info};

use crate::chain::JobMetadata;
use crate::db::models::{to_db_int, JobStatus, NewJob};
use crate::db::unit_of_work::JobTransition;
use crate::db::UnitOfWork;
use crate::error::IndexerResult;

pub mod event;

pub use event::{FieldError, RegistryEvent};

/// Inclusive upper bound of a worker's reputation.
pub const MAX_REPUTATION: i64 = 1000;

/// Result of projecting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Derived entities changed
    Applied,
    /// Event already reflected in the projection
    Unchanged,
    /// Precondition failed; nothing was written
    Skipped(Anomaly),
    /// Unknown event kind, stored only
    Ignored,
}

/// Data-quality problem found while projecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Event references a worker that was never registered
    WorkerNotFound {
        /// Missing worker
        address: String,
    },
    /// Event references a job that was never created
    JobNotFound {
        /// Missing job
        job_id: u64,
    },
    /// Job is not in the predecessor state of this transition
    UnexpectedJobStatus {
        /// Job in question
        job_id: u64,
        /// Status the transition requires
        expected: JobStatus,
        /// Status found in storage
        actual: String,
    },
    /// The contract has no record for a job the event names
    JobMetadataUnavailable {
        /// Job in question
        job_id: u64,
    },
    /// Known event with missing or ill-typed fields
    MalformedPayload {
        /// Event name
        event_name: String,
        /// Parse failure
        reason: String,
    },
    /// Reputation outside `[0, MAX_REPUTATION]`
    ReputationOutOfRange {
        /// Worker in question
        address: String,
        /// Offending value
        value: i64,
    },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerNotFound { address } => write!(f, "worker {address} not found"),
            Self::JobNotFound { job_id } => write!(f, "job {job_id} not found"),
            Self::UnexpectedJobStatus {
                job_id,
                expected,
                actual,
            } => write!(f, "job {job_id} is {actual}, expected {expected}"),
            Self::JobMetadataUnavailable { job_id } => {
                write!(f, "no on-chain record for job {job_id}")
            }
            Self::MalformedPayload { event_name, reason } => {
                write!(f, "malformed {event_name} payload: {reason}")
            }
            Self::ReputationOutOfRange { address, value } => write!(
                f,
                "reputation {value} for {address} outside 0..={MAX_REPUTATION}"
            ),
        }
    }
}

/// Where the event being projected came from.
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    /// Transaction hash of the event
    pub transaction_hash: &'a str,
    /// Block of the event
    pub block_number: u64,
}

/// Apply one event to the projection.
///
/// `metadata` is the hydrated job record for events whose
/// [`RegistryEvent::hydration_target`] is set, `None` otherwise or when the
/// contract has no such job.
///
/// # Errors
///
/// Returns an error only when a storage operation fails; the caller must
/// then drop the unit of work.
pub async fn apply(
    uow: &mut UnitOfWork,
    event: &RegistryEvent,
    ctx: EventContext<'_>,
    metadata: Option<&JobMetadata>,
) -> IndexerResult<Outcome> {
    match event {
        RegistryEvent::WorkerRegistered {
            worker,
            info_reference,
        } => worker_registered(uow, worker, info_reference.as_deref()).await,
        RegistryEvent::WorkerVerified { worker, verifier } => {
            worker_verified(uow, worker, verifier).await
        }
        RegistryEvent::JobCreated {
            job_id,
            creator,
            reward,
            deadline,
        } => {
            let summary = NewJobSummary {
                job_id: *job_id,
                creator,
                reward: *reward,
                deadline: *deadline,
            };
            job_created(uow, &summary, ctx, metadata).await
        }
        RegistryEvent::JobAssigned { job_id, worker } => {
            job_assigned(uow, *job_id, worker, ctx).await
        }
        RegistryEvent::JobCompleted {
            job_id,
            quality_score,
        } => job_completed(uow, *job_id, *quality_score, ctx, metadata).await,
        RegistryEvent::JobCancelled { job_id } => job_cancelled(uow, *job_id, ctx).await,
        RegistryEvent::ReputationUpdated {
            worker,
            old_reputation,
            new_reputation,
            reason,
            related_job_id,
        } => {
            let update = ReputationChange {
                worker,
                old_reputation: *old_reputation,
                new_reputation: *new_reputation,
                reason,
                related_job_id: *related_job_id,
            };
            reputation_updated(uow, &update, ctx).await
        }
        RegistryEvent::Unknown { name } => {
            debug!(event_name = %name, "No projection for event");
            Ok(Outcome::Ignored)
        }
    }
}

struct NewJobSummary<'a> {
    job_id: u64,
    creator: &'a str,
    reward: U256,
    deadline: i64,
}

struct ReputationChange<'a> {
    worker: &'a str,
    old_reputation: i64,
    new_reputation: i64,
    reason: &'a str,
    related_job_id: Option<u64>,
}

async fn worker_registered(
    uow: &mut UnitOfWork,
    worker: &str,
    info_reference: Option<&str>,
) -> IndexerResult<Outcome> {
    if uow.insert_worker(worker, info_reference).await? {
        info!(worker, "Worker registered");
        Ok(Outcome::Applied)
    } else {
        debug!(worker, "Worker already registered");
        Ok(Outcome::Unchanged)
    }
}

async fn worker_verified(
    uow: &mut UnitOfWork,
    worker: &str,
    verifier: &str,
) -> IndexerResult<Outcome> {
    if uow.find_worker(worker).await?.is_none() {
        return Ok(Outcome::Skipped(Anomaly::WorkerNotFound {
            address: worker.to_string(),
        }));
    }

    uow.verify_worker(worker, verifier).await?;
    info!(worker, verifier, "Worker verified");
    Ok(Outcome::Applied)
}

async fn job_created(
    uow: &mut UnitOfWork,
    summary: &NewJobSummary<'_>,
    ctx: EventContext<'_>,
    metadata: Option<&JobMetadata>,
) -> IndexerResult<Outcome> {
    let job_id = summary.job_id;
    let chain_job_id = to_db_int(job_id, "job id")?;

    if uow.find_job(chain_job_id).await?.is_some() {
        debug!(job_id, "Job already exists");
        return Ok(Outcome::Unchanged);
    }

    let Some(metadata) = metadata else {
        return Ok(Outcome::Skipped(Anomaly::JobMetadataUnavailable { job_id }));
    };

    let row_id = uow
        .insert_job(&NewJob {
            chain_job_id,
            creator_address: summary.creator.to_string(),
            asset_reference: metadata.asset_reference.clone(),
            reward_amount: summary.reward,
            deadline: summary.deadline,
            min_reputation: metadata.min_reputation,
        })
        .await?;

    uow.append_job_event(
        row_id,
        &JobTransition {
            event_type: "created",
            transaction_hash: ctx.transaction_hash,
            block_number: to_db_int(ctx.block_number, "block_number")?,
            actor_address: Some(summary.creator),
            event_data: Some(json!({
                "reward": summary.reward.to_string(),
                "deadline": summary.deadline,
            })),
        },
    )
    .await?;

    info!(job_id, creator = summary.creator, reward = %summary.reward, "Job created");
    Ok(Outcome::Applied)
}

async fn job_assigned(
    uow: &mut UnitOfWork,
    job_id: u64,
    worker: &str,
    ctx: EventContext<'_>,
) -> IndexerResult<Outcome> {
    let Some(job) = uow.find_job(to_db_int(job_id, "job id")?).await? else {
        return Ok(Outcome::Skipped(Anomaly::JobNotFound { job_id }));
    };
    if job.status != JobStatus::Open.as_str() {
        return Ok(Outcome::Skipped(Anomaly::UnexpectedJobStatus {
            job_id,
            expected: JobStatus::Open,
            actual: job.status,
        }));
    }
    if uow.find_worker(worker).await?.is_none() {
        return Ok(Outcome::Skipped(Anomaly::WorkerNotFound {
            address: worker.to_string(),
        }));
    }

    if !uow.assign_job(job.id, worker).await? {
        return Ok(Outcome::Skipped(Anomaly::UnexpectedJobStatus {
            job_id,
            expected: JobStatus::Open,
            actual: job.status,
        }));
    }

    uow.append_job_event(
        job.id,
        &JobTransition {
            event_type: "assigned",
            transaction_hash: ctx.transaction_hash,
            block_number: to_db_int(ctx.block_number, "block_number")?,
            actor_address: Some(worker),
            event_data: None,
        },
    )
    .await?;

    info!(job_id, worker, "Job assigned");
    Ok(Outcome::Applied)
}

async fn job_completed(
    uow: &mut UnitOfWork,
    job_id: u64,
    quality_score: i64,
    ctx: EventContext<'_>,
    metadata: Option<&JobMetadata>,
) -> IndexerResult<Outcome> {
    let Some(job) = uow.find_job(to_db_int(job_id, "job id")?).await? else {
        return Ok(Outcome::Skipped(Anomaly::JobNotFound { job_id }));
    };
    if job.status != JobStatus::Assigned.as_str() {
        return Ok(Outcome::Skipped(Anomaly::UnexpectedJobStatus {
            job_id,
            expected: JobStatus::Assigned,
            actual: job.status,
        }));
    }
    let Some(metadata) = metadata else {
        return Ok(Outcome::Skipped(Anomaly::JobMetadataUnavailable { job_id }));
    };

    let worker_address = job.worker_address.clone().unwrap_or_default();
    let Some(worker) = uow.find_worker(&worker_address).await? else {
        return Ok(Outcome::Skipped(Anomaly::WorkerNotFound {
            address: worker_address,
        }));
    };
    let reward = job.reward_u256()?;

    // Job first, then the worker; both land in this unit's transaction.
    if !uow
        .complete_job(job.id, metadata.result_reference.as_deref(), quality_score)
        .await?
    {
        return Ok(Outcome::Skipped(Anomaly::UnexpectedJobStatus {
            job_id,
            expected: JobStatus::Assigned,
            actual: job.status,
        }));
    }
    uow.credit_worker(&worker, reward).await?;

    uow.append_job_event(
        job.id,
        &JobTransition {
            event_type: "completed",
            transaction_hash: ctx.transaction_hash,
            block_number: to_db_int(ctx.block_number, "block_number")?,
            actor_address: Some(&worker.address),
            event_data: Some(json!({
                "quality_score": quality_score,
                "result_reference": metadata.result_reference,
            })),
        },
    )
    .await?;

    info!(
        job_id,
        quality_score,
        worker = %worker.address,
        reward = %reward,
        "Job completed"
    );
    Ok(Outcome::Applied)
}

async fn job_cancelled(
    uow: &mut UnitOfWork,
    job_id: u64,
    ctx: EventContext<'_>,
) -> IndexerResult<Outcome> {
    let Some(job) = uow.find_job(to_db_int(job_id, "job id")?).await? else {
        return Ok(Outcome::Skipped(Anomaly::JobNotFound { job_id }));
    };
    if !uow.cancel_job(job.id).await? {
        return Ok(Outcome::Skipped(Anomaly::UnexpectedJobStatus {
            job_id,
            expected: JobStatus::Open,
            actual: job.status,
        }));
    }

    uow.append_job_event(
        job.id,
        &JobTransition {
            event_type: "cancelled",
            transaction_hash: ctx.transaction_hash,
            block_number: to_db_int(ctx.block_number, "block_number")?,
            actor_address: Some(&job.creator_address),
            event_data: None,
        },
    )
    .await?;

    info!(job_id, "Job cancelled");
    Ok(Outcome::Applied)
}

async fn reputation_updated(
    uow: &mut UnitOfWork,
    change: &ReputationChange<'_>,
    ctx: EventContext<'_>,
) -> IndexerResult<Outcome> {
    if !(0..=MAX_REPUTATION).contains(&change.new_reputation) {
        return Ok(Outcome::Skipped(Anomaly::ReputationOutOfRange {
            address: change.worker.to_string(),
            value: change.new_reputation,
        }));
    }
    if uow.find_worker(change.worker).await?.is_none() {
        return Ok(Outcome::Skipped(Anomaly::WorkerNotFound {
            address: change.worker.to_string(),
        }));
    }

    let related_job_id = change
        .related_job_id
        .map(|id| to_db_int(id, "job id"))
        .transpose()?;

    uow.set_reputation(change.worker, change.new_reputation).await?;
    uow.append_reputation_history(
        change.worker,
        change.old_reputation,
        change.new_reputation,
        change.reason,
        related_job_id,
        ctx.transaction_hash,
    )
    .await?;

    info!(
        worker = change.worker,
        old = change.old_reputation,
        new = change.new_reputation,
        reason = change.reason,
        "Reputation updated"
    );
    Ok(Outcome::Applied)
}

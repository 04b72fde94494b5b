//! One SQLite transaction per ingested event.
//!
//! A [`UnitOfWork`] owns the transaction that stores a raw event, applies its
//! projection and flips `processed`. Nothing is visible to readers until
//! [`UnitOfWork::commit`]; dropping it without committing rolls everything
//! back.
//!
//! Every statement here runs on the transaction's own connection. Going
//! through the pool while a unit is open would wait on the write lock this
//! unit already holds.

use alloy::primitives::U256;
use sqlx::{Sqlite, Transaction};
use tracing::debug;

use super::models::{EventPresence, JobRecord, JobStatus, NewContractEvent, NewJob, WorkerRecord};
use crate::error::{db_err, IndexerError, IndexerResult};

/// Default reputation given to a newly registered worker.
pub const DEFAULT_REPUTATION: i64 = 500;

/// Audit row describing one job transition.
#[derive(Debug, Clone)]
pub struct JobTransition<'a> {
    /// `created`, `assigned`, `completed` or `cancelled`
    pub event_type: &'a str,
    /// Transaction that caused the transition
    pub transaction_hash: &'a str,
    /// Block of that transaction
    pub block_number: i64,
    /// Address that triggered the transition
    pub actor_address: Option<&'a str>,
    /// Extra JSON details
    pub event_data: Option<serde_json::Value>,
}

/// Transaction scope for a single event.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
    now: i64,
}

impl UnitOfWork {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>) -> Self {
        Self {
            tx,
            now: chrono::Utc::now().timestamp(),
        }
    }

    /// Timestamp used for every `*_at` column written by this unit.
    #[must_use]
    pub const fn now(&self) -> i64 {
        self.now
    }

    // ==================== EVENT STORE ====================

    /// Presence of a natural key, read inside the transaction.
    pub async fn event_presence(
        &mut self,
        transaction_hash: &str,
        event_index: u32,
    ) -> IndexerResult<EventPresence> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT processed FROM contract_events WHERE transaction_hash = ? AND event_index = ?",
        )
        .bind(transaction_hash)
        .bind(i64::from(event_index))
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err("Failed to check event presence"))?;

        Ok(match row {
            None => EventPresence::Absent,
            Some((false,)) => EventPresence::Unprocessed,
            Some((true,)) => EventPresence::Processed,
        })
    }

    /// Insert a raw event with `processed = false`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexerError::DuplicateKey`] when the natural key is already
    /// stored, and a database error for anything else.
    pub async fn insert_event(&mut self, event: &NewContractEvent) -> IndexerResult<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO contract_events (
                transaction_hash, block_number, event_index, contract_address,
                event_name, event_data, processed, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, 0, ?)
            ",
        )
        .bind(&event.transaction_hash)
        .bind(event.block_number)
        .bind(i64::from(event.event_index))
        .bind(&event.contract_address)
        .bind(&event.event_name)
        .bind(&event.event_data)
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if matches!(&e, sqlx::Error::Database(db) if db.is_unique_violation()) {
                IndexerError::duplicate_key(&event.transaction_hash, event.event_index)
            } else {
                IndexerError::database("Failed to insert contract event", Some(Box::new(e)))
            }
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Flip `processed` to true. Never flips it back.
    pub async fn mark_processed(
        &mut self,
        transaction_hash: &str,
        event_index: u32,
    ) -> IndexerResult<()> {
        sqlx::query(
            r"
            UPDATE contract_events
            SET processed = 1, processed_at = ?
            WHERE transaction_hash = ? AND event_index = ? AND processed = 0
            ",
        )
        .bind(self.now)
        .bind(transaction_hash)
        .bind(i64::from(event_index))
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to mark event processed"))?;

        Ok(())
    }

    // ==================== WORKERS ====================

    /// Look up a worker by (already normalized) address.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_worker(&mut self, address: &str) -> IndexerResult<Option<WorkerRecord>> {
        sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE address = ?")
            .bind(address)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("Failed to query worker"))
    }

    /// Create a worker with default reputation. Returns false if it already existed.
    pub async fn insert_worker(
        &mut self,
        address: &str,
        info_reference: Option<&str>,
    ) -> IndexerResult<bool> {
        let result = sqlx::query(
            r"
            INSERT INTO workers (address, info_reference, reputation, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (address) DO NOTHING
            ",
        )
        .bind(address)
        .bind(info_reference)
        .bind(DEFAULT_REPUTATION)
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to insert worker"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a worker verified by `verifier`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails.
    pub async fn verify_worker(&mut self, address: &str, verifier: &str) -> IndexerResult<()> {
        sqlx::query(
            "UPDATE workers SET verified = 1, verified_by = ?, verified_at = ? WHERE address = ?",
        )
        .bind(verifier)
        .bind(self.now)
        .bind(address)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to verify worker"))?;

        Ok(())
    }

    /// Credit a completed job: one more job, `reward` more earnings, seen now.
    ///
    /// # Errors
    ///
    /// Returns a decoding error if the stored earnings are corrupt, and a
    /// database error if the worker is missing or the update fails.
    pub async fn credit_worker(&mut self, worker: &WorkerRecord, reward: U256) -> IndexerResult<()> {
        let total = worker.total_earnings_u256()?.saturating_add(reward);

        let result = sqlx::query(
            r"
            UPDATE workers
            SET jobs_completed = jobs_completed + 1, total_earnings = ?, last_seen = ?
            WHERE address = ?
            ",
        )
        .bind(total.to_string())
        .bind(self.now)
        .bind(&worker.address)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to credit worker"))?;

        if result.rows_affected() != 1 {
            return Err(IndexerError::database(
                format!("Worker {} vanished during credit", worker.address),
                None,
            ));
        }

        debug!(worker = %worker.address, total_earnings = %total, "Worker credited");
        Ok(())
    }

    /// Overwrite a worker's reputation.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails, including the table's range check.
    pub async fn set_reputation(&mut self, address: &str, reputation: i64) -> IndexerResult<()> {
        sqlx::query("UPDATE workers SET reputation = ? WHERE address = ?")
            .bind(reputation)
            .bind(address)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("Failed to update reputation"))?;

        Ok(())
    }

    /// Append one reputation history row; `change_amount` is derived.
    pub async fn append_reputation_history(
        &mut self,
        address: &str,
        old_reputation: i64,
        new_reputation: i64,
        reason: &str,
        related_job_id: Option<i64>,
        transaction_hash: &str,
    ) -> IndexerResult<()> {
        sqlx::query(
            r"
            INSERT INTO reputation_history (
                worker_address, old_reputation, new_reputation, change_amount,
                reason, related_job_id, transaction_hash, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(address)
        .bind(old_reputation)
        .bind(new_reputation)
        .bind(new_reputation - old_reputation)
        .bind(reason)
        .bind(related_job_id)
        .bind(transaction_hash)
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to append reputation history"))?;

        Ok(())
    }

    // ==================== JOBS ====================

    /// Look up a job by its contract id.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn find_job(&mut self, chain_job_id: i64) -> IndexerResult<Option<JobRecord>> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE chain_job_id = ?")
            .bind(chain_job_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err("Failed to query job"))
    }

    /// Insert an `open` job and return its row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails, e.g. on a duplicate `chain_job_id`.
    pub async fn insert_job(&mut self, job: &NewJob) -> IndexerResult<i64> {
        let result = sqlx::query(
            r"
            INSERT INTO jobs (
                chain_job_id, creator_address, asset_reference, reward_amount,
                deadline, min_reputation, status, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(job.chain_job_id)
        .bind(&job.creator_address)
        .bind(&job.asset_reference)
        .bind(job.reward_amount.to_string())
        .bind(job.deadline)
        .bind(job.min_reputation)
        .bind(JobStatus::Open.as_str())
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to insert job"))?;

        Ok(result.last_insert_rowid())
    }

    /// `open → assigned`. The status guard is repeated in SQL so a stale
    /// read can never move a job backwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails. A job that is not `open` is
    /// reported as `Ok(false)`, not an error.
    pub async fn assign_job(&mut self, job_id: i64, worker_address: &str) -> IndexerResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET worker_address = ?, status = ?, assigned_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(worker_address)
        .bind(JobStatus::Assigned.as_str())
        .bind(self.now)
        .bind(job_id)
        .bind(JobStatus::Open.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to assign job"))?;

        Ok(result.rows_affected() == 1)
    }

    /// `assigned → completed`.
    pub async fn complete_job(
        &mut self,
        job_id: i64,
        result_reference: Option<&str>,
        quality_score: i64,
    ) -> IndexerResult<bool> {
        let result = sqlx::query(
            r"
            UPDATE jobs
            SET status = ?, result_reference = ?, quality_score = ?, completed_at = ?
            WHERE id = ? AND status = ?
            ",
        )
        .bind(JobStatus::Completed.as_str())
        .bind(result_reference)
        .bind(quality_score)
        .bind(self.now)
        .bind(job_id)
        .bind(JobStatus::Assigned.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to complete job"))?;

        Ok(result.rows_affected() == 1)
    }

    /// `open → cancelled`.
    ///
    /// # Errors
    ///
    /// Returns an error if the update fails. A job that is not `open` is
    /// reported as `Ok(false)`.
    pub async fn cancel_job(&mut self, job_id: i64) -> IndexerResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = ? WHERE id = ? AND status = ?")
            .bind(JobStatus::Cancelled.as_str())
            .bind(job_id)
            .bind(JobStatus::Open.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err("Failed to cancel job"))?;

        Ok(result.rows_affected() == 1)
    }

    /// Append a row to the job's audit trail.
    pub async fn append_job_event(
        &mut self,
        job_id: i64,
        transition: &JobTransition<'_>,
    ) -> IndexerResult<()> {
        sqlx::query(
            r"
            INSERT INTO job_events (
                job_id, event_type, transaction_hash, block_number,
                actor_address, event_data, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(job_id)
        .bind(transition.event_type)
        .bind(transition.transaction_hash)
        .bind(transition.block_number)
        .bind(transition.actor_address)
        .bind(transition.event_data.as_ref().map(ToString::to_string))
        .bind(self.now)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err("Failed to append job event"))?;

        Ok(())
    }

    /// Commit every statement issued through this unit.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite rejects the commit; nothing from this unit
    /// is then visible.
    pub async fn commit(self) -> IndexerResult<()> {
        self.tx
            .commit()
            .await
            .map_err(db_err("Failed to commit transaction"))
    }
}

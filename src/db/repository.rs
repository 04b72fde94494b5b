//! Repository pattern for database operations.
//!
//! Provides the Event Store operations the indexer needs outside of a
//! transaction (presence checks, checkpoint bookkeeping) and the read-side
//! queries used by the CLI and by tests. All writes to the projection go
//! through [`UnitOfWork`].

use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::{
    to_db_int, ContractEventRecord, EventCounts, EventPresence, JobEventRecord, JobRecord,
    ReputationHistoryRecord, WorkerRecord, UNKNOWN_EVENT_NAME,
};
use super::unit_of_work::UnitOfWork;
use crate::error::{db_err, IndexerResult};

/// Repository for database operations.
///
/// Wraps a SQLite connection pool. Cheap to clone.
///
/// # Example
///
/// ```no_run
/// use job_registry_indexer::db::{create_pool, Repository};
///
/// # async fn example() -> job_registry_indexer::error::IndexerResult<()> {
/// let repo = Repository::new(create_pool("sqlite:./indexer.db").await?);
/// repo.save_checkpoint(250).await?;
/// assert_eq!(repo.load_checkpoint().await?, Some(250));
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Creates a new repository with the given connection pool.
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Underlying pool, for ad-hoc queries.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a transaction for one event.
    ///
    /// # Errors
    ///
    /// Returns an error if no connection can be acquired.
    pub async fn begin(&self) -> IndexerResult<UnitOfWork> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("Failed to start transaction"))?;
        Ok(UnitOfWork::new(tx))
    }

    // ==================== EVENT STORE ====================

    /// Whether a natural key is stored and whether its projection committed.
    ///
    /// # Arguments
    ///
    /// * `transaction_hash` - 0x-prefixed hash exactly as stored
    /// * `event_index` - log index within the block
    ///
    /// # Returns
    ///
    /// [`EventPresence::Unprocessed`] marks a row whose projection must run
    /// again; the indexer never skips it.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn event_presence(
        &self,
        transaction_hash: &str,
        event_index: u32,
    ) -> IndexerResult<EventPresence> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT processed FROM contract_events WHERE transaction_hash = ? AND event_index = ?",
        )
        .bind(transaction_hash)
        .bind(i64::from(event_index))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to check event presence"))?;

        Ok(match row {
            None => EventPresence::Absent,
            Some((false,)) => EventPresence::Unprocessed,
            Some((true,)) => EventPresence::Processed,
        })
    }

    /// Whether any row holds this natural key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn exists(&self, transaction_hash: &str, event_index: u32) -> IndexerResult<bool> {
        Ok(self.event_presence(transaction_hash, event_index).await? != EventPresence::Absent)
    }

    /// Highest block among stored events.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn max_block(&self) -> IndexerResult<Option<u64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(block_number) FROM contract_events")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to query max stored block"))?;

        Ok(max.and_then(|b| u64::try_from(b).ok()))
    }

    /// Last block whose chunk was fully ingested, if a checkpoint was ever saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint table cannot be read.
    pub async fn load_checkpoint(&self) -> IndexerResult<Option<u64>> {
        let block: Option<i64> = sqlx::query_scalar(
            "SELECT last_processed_block FROM indexer_checkpoint WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to load checkpoint"))?;

        Ok(block.and_then(|b| u64::try_from(b).ok()))
    }

    /// Record `block` as fully ingested. The stored value never decreases.
    ///
    /// # Errors
    ///
    /// Returns an error if `block` exceeds `i64::MAX` or the upsert fails.
    #[instrument(skip(self))]
    pub async fn save_checkpoint(&self, block: u64) -> IndexerResult<()> {
        let block = to_db_int(block, "checkpoint block")?;

        sqlx::query(
            r"
            INSERT INTO indexer_checkpoint (id, last_processed_block, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                last_processed_block = MAX(last_processed_block, excluded.last_processed_block),
                updated_at = excluded.updated_at
            ",
        )
        .bind(block)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(db_err("Failed to save checkpoint"))?;

        debug!(block, "Checkpoint saved");
        Ok(())
    }

    /// One stored event by natural key.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_event(
        &self,
        transaction_hash: &str,
        event_index: u32,
    ) -> IndexerResult<Option<ContractEventRecord>> {
        sqlx::query_as::<_, ContractEventRecord>(
            "SELECT * FROM contract_events WHERE transaction_hash = ? AND event_index = ?",
        )
        .bind(transaction_hash)
        .bind(i64::from(event_index))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("Failed to query contract event"))
    }

    /// Most recent stored events, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_recent_events(&self, limit: i64) -> IndexerResult<Vec<ContractEventRecord>> {
        sqlx::query_as::<_, ContractEventRecord>(
            r"
            SELECT * FROM contract_events
            ORDER BY block_number DESC, event_index DESC
            LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to query recent events"))
    }

    /// Totals over the event store.
    ///
    /// # Errors
    ///
    /// Returns an error if the aggregate query fails.
    pub async fn event_counts(&self) -> IndexerResult<EventCounts> {
        sqlx::query_as::<_, EventCounts>(
            r"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(processed), 0) AS processed,
                COALESCE(SUM(event_name = ?), 0) AS unknown
            FROM contract_events
            ",
        )
        .bind(UNKNOWN_EVENT_NAME)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err("Failed to count events"))
    }

    // ==================== PROJECTION READS ====================

    /// A worker by address, matched case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row does not decode.
    pub async fn get_worker(&self, address: &str) -> IndexerResult<Option<WorkerRecord>> {
        sqlx::query_as::<_, WorkerRecord>("SELECT * FROM workers WHERE address = ?")
            .bind(address.to_ascii_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to query worker"))
    }

    /// Number of projected workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_workers(&self) -> IndexerResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM workers")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err("Failed to count workers"))
    }

    /// A job by its contract id.
    ///
    /// # Errors
    ///
    /// Returns an error if `chain_job_id` exceeds `i64::MAX` or the query fails.
    pub async fn get_job(&self, chain_job_id: u64) -> IndexerResult<Option<JobRecord>> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE chain_job_id = ?")
            .bind(to_db_int(chain_job_id, "job id")?)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("Failed to query job"))
    }

    /// `(status, count)` for every status that has at least one job.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn count_jobs_by_status(&self) -> IndexerResult<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to count jobs"))
    }

    /// Audit trail of a job, in the order transitions were applied.
    ///
    /// # Errors
    ///
    /// Returns an error if `chain_job_id` exceeds `i64::MAX` or the query fails.
    pub async fn get_job_events(&self, chain_job_id: u64) -> IndexerResult<Vec<JobEventRecord>> {
        sqlx::query_as::<_, JobEventRecord>(
            r"
            SELECT je.* FROM job_events je
            JOIN jobs j ON j.id = je.job_id
            WHERE j.chain_job_id = ?
            ORDER BY je.id ASC
            ",
        )
        .bind(to_db_int(chain_job_id, "job id")?)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to query job events"))
    }

    /// Reputation ledger of a worker, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn get_reputation_history(
        &self,
        address: &str,
    ) -> IndexerResult<Vec<ReputationHistoryRecord>> {
        sqlx::query_as::<_, ReputationHistoryRecord>(
            "SELECT * FROM reputation_history WHERE worker_address = ? ORDER BY id ASC",
        )
        .bind(address.to_ascii_lowercase())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("Failed to query reputation history"))
    }

    /// Checks database connectivity.
    ///
    /// # Errors
    ///
    /// Returns an error if the database does not answer `SELECT 1`.
    pub async fn health_check(&self) -> IndexerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err("Database health check failed"))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_pool;
    use crate::db::models::NewContractEvent;

    async fn setup_test_db() -> Repository {
        let pool = create_pool("sqlite::memory:")
            .await
            .expect("Failed to create test pool");
        Repository::new(pool)
    }

    async fn store(repo: &Repository, hash: &str, block: i64, name: &str, processed: bool) {
        let mut uow = repo.begin().await.unwrap();
        uow.insert_event(&NewContractEvent {
            transaction_hash: hash.to_string(),
            block_number: block,
            event_index: 0,
            contract_address: "0xcontract".to_string(),
            event_name: name.to_string(),
            event_data: "{}".to_string(),
        })
        .await
        .unwrap();
        if processed {
            uow.mark_processed(hash, 0).await.unwrap();
        }
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_block_empty_and_populated() {
        let repo = setup_test_db().await;
        assert_eq!(repo.max_block().await.unwrap(), None);

        store(&repo, "0x01", 120, "JobCreated", true).await;
        store(&repo, "0x02", 95, "JobAssigned", true).await;

        assert_eq!(repo.max_block().await.unwrap(), Some(120));
        assert!(repo.exists("0x01", 0).await.unwrap());
        assert!(!repo.exists("0x01", 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_is_monotonic() {
        let repo = setup_test_db().await;
        assert_eq!(repo.load_checkpoint().await.unwrap(), None);

        repo.save_checkpoint(250).await.unwrap();
        assert_eq!(repo.load_checkpoint().await.unwrap(), Some(250));

        repo.save_checkpoint(100).await.unwrap();
        assert_eq!(repo.load_checkpoint().await.unwrap(), Some(250));

        repo.save_checkpoint(300).await.unwrap();
        assert_eq!(repo.load_checkpoint().await.unwrap(), Some(300));
    }

    #[tokio::test]
    async fn test_event_counts() {
        let repo = setup_test_db().await;
        assert_eq!(repo.event_counts().await.unwrap(), EventCounts::default());

        store(&repo, "0x01", 1, "JobCreated", true).await;
        store(&repo, "0x02", 2, UNKNOWN_EVENT_NAME, true).await;
        store(&repo, "0x03", 3, "JobAssigned", false).await;

        let counts = repo.event_counts().await.unwrap();
        assert_eq!(counts.total, 3);
        assert_eq!(counts.processed, 2);
        assert_eq!(counts.unknown, 1);
        assert_eq!(
            repo.event_presence("0x03", 0).await.unwrap(),
            EventPresence::Unprocessed
        );
    }

    #[tokio::test]
    async fn test_get_worker_ignores_case() {
        let repo = setup_test_db().await;
        let mut uow = repo.begin().await.unwrap();
        uow.insert_worker("0x00000000000000000000000000000000000000bb", None)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let found = repo
            .get_worker("0x00000000000000000000000000000000000000BB")
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(repo.count_workers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_health_check() {
        let repo = setup_test_db().await;
        repo.health_check().await.expect("Health check failed");
    }
}

//! Restart, recovery and loop lifecycle.

mod common;

use std::time::Duration;

use common::*;
use job_registry_indexer::config::IndexerSettings;
use job_registry_indexer::indexer::{Indexer, Phase};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() -> eyre::Result<()> {
    init_log();
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("indexer.db");

    {
        let repo = file_repository(&path).await;
        let chain = FakeChain::new(250);
        chain.push(5, 0, Some(worker_registered(WORKER)));
        chain.push(120, 0, Some(worker_registered(OTHER_WORKER)));

        let report = indexer(&repo, &chain, 1).catch_up().await?;
        assert_eq!(report.start_block, 1);
        assert_eq!(report.last_processed_block, Some(250));
        assert_eq!(
            chain.get_events_calls(),
            [(1, 100), (101, 200), (201, 250)]
        );
        repo.pool().close().await;
    }

    let repo = file_repository(&path).await;
    assert_eq!(repo.load_checkpoint().await?, Some(250));

    let chain = FakeChain::new(300);
    let indexer = indexer(&repo, &chain, 1);
    let report = indexer.catch_up().await?;

    assert_eq!(report.start_block, 251);
    assert_eq!(chain.get_events_calls(), [(251, 300)]);
    assert_eq!(report.last_processed_block, Some(300));
    assert_eq!(repo.count_workers().await?, 2);
    Ok(())
}

#[tokio::test]
async fn test_without_checkpoint_resumes_at_highest_stored_block() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(130);
    chain.push(120, 0, Some(worker_registered(WORKER)));
    indexer(&repo, &chain, 1).catch_up().await?;

    sqlx::query("DELETE FROM indexer_checkpoint")
        .execute(repo.pool())
        .await?;

    let chain = FakeChain::new(130);
    chain.push(120, 0, Some(worker_registered(WORKER)));
    let report = indexer(&repo, &chain, 1).catch_up().await?;

    assert_eq!(report.start_block, 120);
    assert_eq!(chain.get_events_calls(), [(120, 130)]);
    assert_eq!(repo.event_counts().await?.total, 1);
    assert_eq!(repo.load_checkpoint().await?, Some(130));
    Ok(())
}

#[tokio::test]
async fn test_empty_store_starts_at_configured_block() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(1050);

    let report = indexer(&repo, &chain, 1000).catch_up().await?;

    assert_eq!(report.start_block, 1000);
    assert_eq!(chain.get_events_calls(), [(1000, 1050)]);
    assert_eq!(repo.load_checkpoint().await?, Some(1050));
    Ok(())
}

#[tokio::test]
async fn test_head_behind_checkpoint_fetches_nothing() -> eyre::Result<()> {
    let repo = memory_repository().await;
    repo.save_checkpoint(300).await?;
    let chain = FakeChain::new(250);

    let report = indexer(&repo, &chain, 1).catch_up().await?;

    assert_eq!(report.start_block, 301);
    assert_eq!(report.last_processed_block, Some(300));
    assert_eq!(report.chain_head, Some(250));
    assert!(chain.get_events_calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_loop_follows_new_blocks_until_stopped() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(50);
    chain.push(40, 0, Some(worker_registered(WORKER)));

    let indexer = indexer(&repo, &chain, 1);
    assert_eq!(indexer.status().phase, Phase::Stopped);
    indexer.start();
    assert!(indexer.is_running());

    assert!(wait_until(WAIT, || indexer.status().last_processed_block == Some(50)).await);

    chain.push(70, 0, Some(worker_registered(OTHER_WORKER)));
    chain.set_head(80);
    assert!(wait_until(WAIT, || indexer.status().last_processed_block == Some(80)).await);

    indexer.stop().await;
    let status = indexer.status();
    assert!(!indexer.is_running());
    assert!(!status.running);
    assert_eq!(status.phase, Phase::Stopped);
    assert_eq!(status.events_ingested, 2);

    assert_eq!(repo.count_workers().await?, 2);
    assert_eq!(repo.load_checkpoint().await?, Some(80));
    Ok(())
}

#[tokio::test]
async fn test_loop_backs_off_and_recovers_from_rpc_errors() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(30);
    chain.push(20, 0, Some(worker_registered(WORKER)));
    chain.fail_latest(2);
    chain.fail_get_events(1);

    let indexer = indexer(&repo, &chain, 1);
    indexer.start();
    assert!(wait_until(WAIT, || indexer.status().last_processed_block == Some(30)).await);
    indexer.stop().await;

    assert!(chain.latest_calls() >= 4);
    // The failed chunk is fetched again from the same block.
    let calls = chain.get_events_calls();
    assert_eq!(calls[..2], [(1, 30), (1, 30)]);

    let status = indexer.status();
    assert!(status.last_error.is_none());
    assert_eq!(status.events_ingested, 1);
    assert!(repo.get_worker(WORKER).await?.is_some());
    Ok(())
}

#[tokio::test]
async fn test_stop_interrupts_backoff() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(30);
    chain.fail_latest(usize::MAX);

    let settings = IndexerSettings {
        backoff: Duration::from_secs(3600),
        ..settings(1)
    };
    let indexer = Indexer::new(repo.clone(), chain.clone(), settings);
    indexer.start();

    assert!(wait_until(WAIT, || indexer.status().phase == Phase::Backoff).await);
    let status = indexer.status();
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection refused")));

    tokio::time::timeout(WAIT, indexer.stop()).await?;
    assert!(!indexer.is_running());
    assert_eq!(indexer.status().phase, Phase::Stopped);
    assert_eq!(repo.load_checkpoint().await?, None);
    Ok(())
}

#[tokio::test]
async fn test_stop_mid_chunk_finishes_current_event() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(20);
    chain.push(10, 0, Some(worker_registered(WORKER)));
    chain.push(11, 0, Some(job_created(7, 1000)));
    chain.push(12, 0, Some(worker_registered(OTHER_WORKER)));
    chain.set_job(7, job_metadata());
    chain.hold_job_info();

    let first = indexer(&repo, &chain, 1);
    first.start();
    assert!(wait_until(WAIT, || !chain.job_info_calls().is_empty()).await);

    // Stop while the creation waits on hydration, then let it finish.
    let release = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        chain.release_job_info();
    };
    tokio::time::timeout(WAIT, async { tokio::join!(first.stop(), release) }).await?;

    assert!(!first.is_running());
    assert!(repo.get_job(7).await?.is_some());
    assert!(!repo.exists(&tx_hash(12, 0), 0).await?);
    assert_eq!(repo.load_checkpoint().await?, None);

    let second = indexer(&repo, &chain, 1);
    let report = second.catch_up().await?;

    assert_eq!(report.start_block, 11);
    assert_eq!(report.last_processed_block, Some(20));
    assert_eq!(repo.event_counts().await?.total, 3);
    assert_eq!(repo.get_job_events(7).await?.len(), 1);
    assert_eq!(repo.count_workers().await?, 2);
    assert_eq!(chain.job_info_calls(), [7]);
    Ok(())
}

#[tokio::test]
async fn test_configuration_error_ends_loop() -> eyre::Result<()> {
    let repo = memory_repository().await;
    let chain = FakeChain::new(30);
    chain.misconfigure();

    let indexer = indexer(&repo, &chain, 1);
    indexer.start();
    assert!(wait_until(WAIT, || !indexer.is_running()).await);

    let status = indexer.status();
    assert_eq!(status.phase, Phase::Stopped);
    assert!(status
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("chain id mismatch")));
    assert_eq!(chain.latest_calls(), 1);

    indexer.stop().await;
    assert_eq!(repo.load_checkpoint().await?, None);
    Ok(())
}

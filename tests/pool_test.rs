//! Engine pool: lease exclusivity, waiting, replacement of dead sessions.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use analysis_worker::{EnginePool, PoolConfig, SessionState, WorkerError};
use common::{fast_options, pool_config, start_pool, start_pool_with, wait_for_idle, Script, ScriptedLauncher, START_FEN};

#[tokio::test]
async fn test_pool_starts_all_sessions() {
    let script = Script::new();
    let pool = start_pool(&script, 3).await;

    let status = pool.status();
    assert_eq!(status.size, 3);
    assert_eq!(status.idle, 3);
    assert_eq!(status.leased, 0);
    assert_eq!(script.launches(), 3);
}

#[tokio::test]
async fn test_leases_never_exceed_pool_size() {
    let script = Script::new();
    let pool = start_pool(&script, 2).await;
    let held = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let held = held.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let lease = pool.acquire().await?;
                let now = held.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(pool.status().leased <= 2);
                tokio::time::sleep(Duration::from_millis(20)).await;
                held.fetch_sub(1, Ordering::SeqCst);
                drop(lease);
                Ok::<_, WorkerError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    wait_for_idle(&pool, 2).await;
    assert_eq!(script.launches(), 2);
}

#[tokio::test]
async fn test_distinct_sessions_are_leased() {
    let script = Script::new();
    let pool = start_pool(&script, 2).await;

    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!(pool.status().idle, 0);
}

#[tokio::test]
async fn test_acquire_times_out_when_exhausted() {
    let script = Script::new();
    let pool = start_pool_with(
        &script,
        PoolConfig {
            acquire_timeout: Duration::from_millis(50),
            ..pool_config(1)
        },
    )
    .await;

    let _held = pool.acquire().await.unwrap();
    let err = pool.acquire().await.err().unwrap();
    assert!(matches!(err, WorkerError::AcquireTimeout(_)), "{err}");
}

#[tokio::test]
async fn test_waiter_is_served_after_release() {
    let script = Script::new();
    let pool = start_pool(&script, 1).await;

    let held = pool.acquire().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|lease| lease.id()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    let id = held.id();
    drop(held);
    assert_eq!(waiter.await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn test_crashed_session_is_replaced() {
    let script = Script::new();
    let pool = start_pool(&script, 2).await;

    let mut lease = pool.acquire().await.unwrap();
    lease.set_position(START_FEN).await.unwrap();
    script.crash_next_searches(1);
    let err = lease.search_to_depth(10).await.unwrap().finish().await.unwrap_err();
    assert!(matches!(err, WorkerError::EngineCrash(_)), "{err}");
    assert!(lease.is_dead());
    drop(lease);

    wait_for_idle(&pool, 2).await;
    assert_eq!(script.launches(), 3);
    assert_eq!(pool.status().replacing, 0);

    // The replacement works.
    let mut lease = pool.acquire().await.unwrap();
    lease.set_position(START_FEN).await.unwrap();
    let outcome = lease.search_to_depth(10).await.unwrap().finish().await.unwrap();
    assert_eq!(outcome.depth_reached, 12);
}

#[tokio::test]
async fn test_replacement_retries_failed_launches() {
    let script = Script::new();
    let pool = start_pool(&script, 1).await;

    let mut lease = pool.acquire().await.unwrap();
    lease.set_position(START_FEN).await.unwrap();
    script.crash_next_searches(1);
    script.fail_next_launches(2);
    let _ = lease.search_to_depth(10).await.unwrap().finish().await;
    drop(lease);

    wait_for_idle(&pool, 1).await;
    // Initial launch, two failures, one success.
    assert_eq!(script.launches(), 4);
}

#[tokio::test]
async fn test_abandoned_search_is_recovered() {
    let script = Script::new();
    script.set_hang(true);
    let pool = start_pool(&script, 1).await;

    {
        let mut lease = pool.acquire().await.unwrap();
        lease.set_position(START_FEN).await.unwrap();
        drop(lease.search_to_depth(30).await.unwrap());
        assert_eq!(lease.state(), SessionState::Searching);
    }

    wait_for_idle(&pool, 1).await;
    assert_eq!(script.launches(), 1);

    let lease = pool.acquire().await.unwrap();
    assert_eq!(lease.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_closes_pool() {
    let script = Script::new();
    let pool = start_pool(&script, 2).await;

    pool.shutdown().await;
    pool.shutdown().await;

    assert!(pool.is_closed());
    assert_eq!(pool.status().idle, 0);
    assert!(matches!(pool.acquire().await, Err(WorkerError::PoolClosed)));
}

#[tokio::test]
async fn test_shutdown_wakes_waiters() {
    let script = Script::new();
    let pool = start_pool(&script, 1).await;
    let _held = pool.acquire().await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pool.shutdown().await;

    assert!(matches!(waiter.await.unwrap(), Err(WorkerError::PoolClosed)));
}

#[tokio::test]
async fn test_start_fails_when_engine_will_not_launch() {
    let script = Script::new();
    script.fail_next_launches(1);
    let launcher = Arc::new(ScriptedLauncher {
        script: script.clone(),
    });

    let result = EnginePool::start(launcher, fast_options(), pool_config(2)).await;
    assert!(matches!(result, Err(WorkerError::EngineStartup(_))));
}

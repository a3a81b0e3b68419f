//! Integration tests for the session pool.

mod common;

use common::{FakeConnector, FakeDb, Reply};
use exasol_provider::db::{ConnectionPool, PoolMode};
use exasol_provider::error::ProviderError;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn run_concurrently(pool: Arc<ConnectionPool>, tasks: usize) {
    let handles: Vec<_> = (0..tasks)
        .map(|_| {
            let pool = pool.clone();
            tokio::spawn(async move { pool.execute("SLEEP", &[]).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_serialized_mode_allows_one_lease() {
    let db = FakeDb::new();
    db.on("SLEEP", Reply::Sleep(Duration::from_millis(20)));
    let pool = Arc::new(db.pool(4, PoolMode::Serialized));

    run_concurrently(pool, 8).await;

    assert_eq!(db.max_active(), 1);
    assert_eq!(db.statements().len(), 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_mode_runs_in_parallel() {
    let db = FakeDb::new();
    db.on("SLEEP", Reply::Sleep(Duration::from_millis(100)));
    let pool = Arc::new(db.pool(4, PoolMode::Independent));

    run_concurrently(pool, 8).await;

    assert!(db.max_active() > 1, "max_active = {}", db.max_active());
    assert!(db.max_active() <= 4, "max_active = {}", db.max_active());
}

#[tokio::test]
async fn test_single_session_never_shared() {
    let db = FakeDb::new();
    db.on("SLEEP", Reply::Sleep(Duration::from_millis(10)));
    let pool = Arc::new(db.pool(1, PoolMode::Independent));

    run_concurrently(pool, 5).await;

    assert_eq!(db.max_active(), 1);
    assert_eq!(db.slots(), vec![0; 5]);
}

#[tokio::test]
async fn test_round_robin_order() {
    let db = FakeDb::new();
    let pool = db.pool(3, PoolMode::Serialized);

    for _ in 0..6 {
        pool.execute("SELECT 1", &[]).await.unwrap();
    }

    assert_eq!(db.slots(), vec![0, 1, 2, 0, 1, 2]);
}

#[tokio::test]
async fn test_lease_keeps_session_until_unlocked() {
    let db = FakeDb::new();
    let pool = db.pool(2, PoolMode::Independent);

    let mut first = pool.lock().await.unwrap();
    let second = pool.lock().await.unwrap();
    assert_ne!(first.slot(), second.slot());

    first.execute("SELECT 1", &[]).await.unwrap();
    first.execute("SELECT 2", &[]).await.unwrap();
    assert_eq!(db.slots(), vec![first.slot(), first.slot()]);

    second.unlock();
    first.unlock();
    assert_ok!(pool.lock().await);
}

#[tokio::test]
async fn test_lock_waits_for_release() {
    let db = FakeDb::new();
    let pool = Arc::new(db.pool(1, PoolMode::Serialized));

    let lease = pool.lock().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.lock().await.map(|lease| lease.slot()) })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());

    lease.unlock();
    assert_eq!(waiter.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn test_close_rejects_new_leases() {
    let db = FakeDb::new();
    let pool = db.pool(3, PoolMode::Independent);

    pool.close().await.unwrap();
    assert!(pool.is_closed());
    assert_eq!(db.closed(), 3);
    assert!(matches!(pool.lock().await, Err(ProviderError::PoolClosed)));
    assert!(matches!(
        pool.execute("SELECT 1", &[]).await,
        Err(ProviderError::PoolClosed)
    ));

    // Closing again is a no-op
    pool.close().await.unwrap();
    assert_eq!(db.closed(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_during_leases_never_hands_out_closed_sessions() {
    for _ in 0..50 {
        let db = FakeDb::new();
        db.on("SLEEP", Reply::Sleep(Duration::from_micros(200)));
        let pool = Arc::new(db.pool(2, PoolMode::Independent));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.execute("SLEEP", &[]).await })
            })
            .collect();
        tokio::task::yield_now().await;
        pool.close().await.unwrap();

        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) | Err(ProviderError::PoolClosed) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(db.used_after_close(), 0);
        assert_eq!(db.closed(), 2);
    }
}

#[tokio::test]
async fn test_connect_opens_every_session() {
    let db = FakeDb::new();
    let connector = FakeConnector::new(db.clone(), None);
    let pool = ConnectionPool::connect(&connector, 3, PoolMode::Serialized)
        .await
        .unwrap();
    assert_eq!(pool.size(), 3);
    assert_eq!(pool.mode(), PoolMode::Serialized);
}

#[tokio::test]
async fn test_connect_failure_closes_opened_sessions() {
    let db = FakeDb::new();
    let connector = FakeConnector::new(db.clone(), Some(2));
    let err = ConnectionPool::connect(&connector, 4, PoolMode::Independent)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "connection");
    assert_eq!(db.closed(), 2);
}

#[tokio::test]
async fn test_zero_size_is_rejected() {
    let connector = FakeConnector::new(FakeDb::new(), None);
    assert_err!(ConnectionPool::connect(&connector, 0, PoolMode::Independent).await);
    assert_err!(ConnectionPool::from_connections(Vec::new(), PoolMode::Serialized));
}

#[tokio::test]
async fn test_errors_propagate_unchanged() {
    let db = FakeDb::new();
    db.on("DROP", Reply::Fail("object FOO not found [line 1, column 11]".to_string()));
    let pool = db.pool(1, PoolMode::Independent);

    let err = pool.execute("DROP TABLE foo", &[]).await.unwrap_err();
    assert!(matches!(err, ProviderError::Database { .. }));
    assert!(err.to_string().contains("object FOO not found"));
}

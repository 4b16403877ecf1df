//! Integration tests for the connection pool under concurrency.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::CountingDialer;
use common::FakeConnection;
use meshgate::pool::ConnectionPool;

const ADDR: &str = "10.0.0.5:50002";

// --- Dialing ---

#[tokio::test]
async fn test_concurrent_callers_share_one_dial() {
    let pool = Arc::new(ConnectionPool::<FakeConnection>::new());
    let dialer = CountingDialer::new().with_delay(Duration::from_millis(30));

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let pool = pool.clone();
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            pool.get_or_create(ADDR, || dialer.connect()).await
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        let conn = task.await.expect("task").expect("connection");
        ids.push(conn.id);
    }

    assert_eq!(dialer.dials(), 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    // The pool's own reference plus one per caller.
    assert_eq!(pool.ref_count(ADDR), Some(17));
}

#[tokio::test]
async fn test_dial_error_reaches_every_waiter() {
    let pool = Arc::new(ConnectionPool::<FakeConnection>::new());
    let dialer = CountingDialer::new()
        .with_delay(Duration::from_millis(30))
        .failing("connection refused");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            pool.get_or_create(ADDR, || dialer.connect()).await
        }));
    }

    for task in tasks {
        let err = task.await.expect("task").unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
    assert_eq!(dialer.dials(), 1);
    assert!(pool.is_empty());

    // A failed dial is not remembered.
    let healthy = CountingDialer::new();
    pool.get_or_create(ADDR, || healthy.connect())
        .await
        .expect("second dial");
    assert_eq!(healthy.dials(), 1);
}

// --- Reference counting ---

#[tokio::test]
async fn test_share_release_destroy_close_once() {
    let pool = ConnectionPool::<FakeConnection>::new();
    let dialer = CountingDialer::new();

    let first = pool
        .get_or_create(ADDR, || dialer.connect())
        .await
        .expect("dial");
    assert_eq!(pool.ref_count(ADDR), Some(2));

    let second = pool.share(ADDR).expect("shared");
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(pool.ref_count(ADDR), Some(3));

    pool.release(ADDR, &second);
    pool.release(ADDR, &first);
    assert_eq!(pool.ref_count(ADDR), Some(1));
    assert_eq!(dialer.closes(), 0);

    pool.destroy(ADDR, &first);
    assert_eq!(dialer.closes(), 1);
    assert!(first.is_closed());

    // Stale handles are ignored.
    pool.release(ADDR, &first);
    pool.destroy(ADDR, &first);
    assert_eq!(dialer.closes(), 1);
    assert!(pool.share(ADDR).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_share_release_destroy_close_each_once() {
    let pool = Arc::new(ConnectionPool::<FakeConnection>::new());
    let dialer = CountingDialer::new();

    let mut tasks = Vec::new();
    for task in 0..32usize {
        let pool = pool.clone();
        let dialer = dialer.clone();
        tasks.push(tokio::spawn(async move {
            for round in 0..50usize {
                let conn = pool
                    .get_or_create(ADDR, || dialer.connect())
                    .await
                    .expect("connection");
                match (task + round) % 4 {
                    0 => pool.destroy(ADDR, &conn),
                    1 => {
                        if let Some(shared) = pool.share(ADDR) {
                            tokio::task::yield_now().await;
                            pool.release(ADDR, &shared);
                        }
                        pool.release(ADDR, &conn);
                    }
                    _ => {
                        tokio::task::yield_now().await;
                        pool.release(ADDR, &conn);
                    }
                }
            }
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    pool.close_all();
    assert!(pool.is_empty());
    assert!(dialer.dials() > 1);
    assert_eq!(dialer.dials(), dialer.closes());
}

#[tokio::test]
async fn test_last_release_closes() {
    let pool = ConnectionPool::<FakeConnection>::new();
    let dialer = CountingDialer::new();

    let conn = pool
        .get_or_create(ADDR, || dialer.connect())
        .await
        .expect("dial");
    pool.release(ADDR, &conn);
    pool.release(ADDR, &conn);

    assert_eq!(dialer.closes(), 1);
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_destroy_forces_redial() {
    let pool = ConnectionPool::<FakeConnection>::new();
    let dialer = CountingDialer::new();

    let lease = pool.lease(ADDR, || dialer.connect()).await.expect("lease");
    let first_id = lease.id;
    lease.destroy();
    assert_eq!(dialer.closes(), 1);

    let lease = pool.lease(ADDR, || dialer.connect()).await.expect("lease");
    assert_ne!(lease.id, first_id);
    assert_eq!(dialer.dials(), 2);
    drop(lease);
    assert_eq!(pool.ref_count(ADDR), Some(1));
}

#[tokio::test]
async fn test_close_all_closes_borrowed_connections() {
    let pool = ConnectionPool::<FakeConnection>::new();
    let dialer = CountingDialer::new();

    let a = pool.get_or_create("a:1", || dialer.connect()).await.expect("a");
    let _b = pool.get_or_create("b:1", || dialer.connect()).await.expect("b");
    pool.close_all();

    assert_eq!(dialer.closes(), 2);
    assert!(a.is_closed());
    assert!(pool.is_empty());

    // Releasing after close_all must not close again.
    pool.release("a:1", &a);
    assert_eq!(dialer.closes(), 2);
}

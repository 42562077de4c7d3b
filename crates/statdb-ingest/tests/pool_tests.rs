//! Connection manager behavior against an in-memory connector
//!
//! The mock connector counts every open, connect, shutdown and close, and can
//! be told to fail opens or to kill every connection of one pool generation.

use async_trait::async_trait;
use statdb_common::retry::BackoffPolicy;
use statdb_ingest::db::{ConnectionManager, Connector, DbError, PoolConfig, PoolConnection, PoolError};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// Mock connector
// ============================================================================

#[derive(Default)]
struct MockShared {
    opens: AtomicU64,
    failing_opens: AtomicU32,
    dead_generation: AtomicU64,
    connects: AtomicUsize,
    shutdowns: AtomicUsize,
    closes: AtomicUsize,
}

impl MockShared {
    /// Every connection of the currently open database stops answering
    fn kill_current(&self) {
        self.dead_generation
            .store(self.opens.load(Ordering::SeqCst), Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
struct MockConnector {
    shared: Arc<MockShared>,
}

struct MockConn {
    id: usize,
    database: u64,
    shared: Arc<MockShared>,
}

impl MockConn {
    fn is_dead(&self) -> bool {
        self.shared.dead_generation.load(Ordering::SeqCst) == self.database
    }

    /// Simulated statement: fails on a dead transport
    fn execute(&self) -> Result<usize, DbError> {
        if self.is_dead() {
            Err(DbError::config("transport closed"))
        } else {
            Ok(self.id)
        }
    }
}

#[async_trait]
impl PoolConnection for MockConn {
    async fn ping(&mut self) -> Result<(), DbError> {
        self.execute().map(|_| ())
    }

    async fn shutdown(self) {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Database = u64;
    type Connection = MockConn;

    async fn open(&self) -> Result<u64, DbError> {
        let failing = self.shared.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(DbError::config("database unavailable"));
        }
        Ok(self.shared.opens.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn connect(&self, database: &u64) -> Result<MockConn, DbError> {
        Ok(MockConn {
            id: self.shared.connects.fetch_add(1, Ordering::SeqCst),
            database: *database,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn close(&self, _database: u64) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

type MockManager = ConnectionManager<MockConnector>;

fn manager(size: usize, acquire_timeout: Duration) -> (Arc<MockManager>, Arc<MockShared>) {
    let connector = MockConnector::default();
    let shared = Arc::clone(&connector.shared);
    let config = PoolConfig {
        size,
        acquire_timeout,
        bootstrap: BackoffPolicy::new(3, Duration::ZERO, Duration::ZERO),
    };
    (Arc::new(ConnectionManager::new(connector, config)), shared)
}

async fn lease_id(manager: &MockManager) -> Result<usize, DbError> {
    manager
        .with_connection(|conn| Box::pin(async move { conn.execute() }))
        .await
}

/// Hold one lease until `release` is notified; `leased` fires once it is held
fn hold_lease(
    manager: &Arc<MockManager>,
    leased: Arc<Notify>,
    release: Arc<Notify>,
) -> tokio::task::JoinHandle<Result<usize, DbError>> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        manager
            .with_connection(move |conn| {
                let leased = Arc::clone(&leased);
                let release = Arc::clone(&release);
                Box::pin(async move {
                    leased.notify_one();
                    release.notified().await;
                    Ok(conn.id)
                })
            })
            .await
    })
}

async fn wait_for_waiters(manager: &MockManager, count: usize) {
    while manager.status().waiting < count {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Leasing
// ============================================================================

#[tokio::test]
async fn test_first_operation_bootstraps_pool() {
    let (manager, shared) = manager(3, Duration::from_secs(1));
    assert!(!manager.status().ready);

    lease_id(&manager).await.unwrap();

    let status = manager.status();
    assert!(status.ready);
    assert_eq!(status.size, 3);
    assert_eq!(status.leased, 0);
    assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
    assert_eq!(shared.connects.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_concurrent_first_callers_share_one_bootstrap() {
    let (manager, shared) = manager(2, Duration::from_secs(5));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { lease_id(&manager).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
    assert_eq!(shared.connects.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_free_connections_rotate() {
    let (manager, _shared) = manager(2, Duration::from_secs(1));

    let first = lease_id(&manager).await.unwrap();
    let second = lease_id(&manager).await.unwrap();
    let third = lease_id(&manager).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(first, third);
}

#[tokio::test]
async fn test_acquire_times_out_without_leaking_a_lease() {
    let (manager, _shared) = manager(1, Duration::from_millis(50));
    let leased = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let holder = hold_lease(&manager, Arc::clone(&leased), Arc::clone(&release));
    leased.notified().await;

    let err = lease_id(&manager).await.unwrap_err();
    assert!(
        matches!(err, DbError::Pool(PoolError::AcquireTimeout { pool_size: 1, .. })),
        "unexpected error: {err}"
    );
    assert_eq!(manager.status().waiting, 0);

    release.notify_one();
    holder.await.unwrap().unwrap();

    // the timed-out waiter never owned the connection
    let status = manager.status();
    assert_eq!(status.leased, 0);
    assert_eq!(status.waiting, 0);
    lease_id(&manager).await.unwrap();
}

#[tokio::test]
async fn test_waiters_are_served_in_arrival_order() {
    let (manager, _shared) = manager(1, Duration::from_secs(5));
    let leased = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let holder = hold_lease(&manager, Arc::clone(&leased), Arc::clone(&release));
    leased.notified().await;

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for name in ["first", "second", "third"] {
        let manager_clone = Arc::clone(&manager);
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            manager_clone
                .with_connection(move |_conn| {
                    let order = Arc::clone(&order);
                    Box::pin(async move {
                        order.lock().unwrap().push(name);
                        Ok::<_, DbError>(())
                    })
                })
                .await
        }));
        wait_for_waiters(&manager, waiters.len()).await;
    }

    release.notify_one();
    holder.await.unwrap().unwrap();
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_operation_error_on_healthy_connection_is_not_retried() {
    let (manager, shared) = manager(2, Duration::from_secs(1));
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let result: Result<(), DbError> = manager
        .with_connection(move |_conn| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DbError::config("constraint violated"))
            })
        })
        .await;

    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "Database configuration error: constraint violated");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
    assert_eq!(manager.status().generation, 0);
}

#[tokio::test]
async fn test_dead_connection_recreates_pool_and_retries_once() {
    let (manager, shared) = manager(2, Duration::from_secs(1));
    lease_id(&manager).await.unwrap();
    shared.kill_current();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let id = manager
        .with_connection(move |conn| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { conn.execute() })
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(shared.opens.load(Ordering::SeqCst), 2);
    assert_eq!(shared.closes.load(Ordering::SeqCst), 1);
    // fresh connections come from the second open
    assert!(id >= 2);
    assert_eq!(manager.status().generation, 1);
    assert_eq!(manager.status().leased, 0);
}

#[tokio::test]
async fn test_retry_failure_after_recovery_is_returned() {
    let (manager, shared) = manager(1, Duration::from_secs(1));
    lease_id(&manager).await.unwrap();
    shared.kill_current();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let result: Result<(), DbError> = manager
        .with_connection(move |_conn| {
            let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Box::pin(async move { Err(DbError::config(format!("attempt {attempt} failed"))) })
        })
        .await;

    assert_eq!(
        result.unwrap_err().to_string(),
        "Database configuration error: attempt 2 failed"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(shared.opens.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_concurrent_failures_recreate_once() {
    let (manager, shared) = manager(2, Duration::from_secs(5));
    let leased = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    // two callers lease both connections of generation 0, then the transport dies
    let both_leased = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let manager = Arc::clone(&manager);
        let leased = Arc::clone(&leased);
        let release = Arc::clone(&release);
        let both_leased = Arc::clone(&both_leased);
        handles.push(tokio::spawn(async move {
            manager
                .with_connection(move |conn| {
                    let leased = Arc::clone(&leased);
                    let release = Arc::clone(&release);
                    let both_leased = Arc::clone(&both_leased);
                    Box::pin(async move {
                        if !conn.is_dead() && conn.database == 1 {
                            if both_leased.fetch_add(1, Ordering::SeqCst) == 1 {
                                leased.notify_one();
                            }
                            release.notified().await;
                        }
                        conn.execute()
                    })
                })
                .await
        }));
    }

    leased.notified().await;
    shared.kill_current();
    release.notify_waiters();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(shared.opens.load(Ordering::SeqCst), 2);
    assert_eq!(manager.status().generation, 1);
}

#[tokio::test]
async fn test_healthcheck_reports_state() {
    let (manager, shared) = manager(1, Duration::from_secs(1));
    assert!(manager.healthcheck().await);

    // a dead pool recovers inside the healthcheck itself
    shared.kill_current();
    assert!(manager.healthcheck().await);
    assert_eq!(shared.opens.load(Ordering::SeqCst), 2);

    manager.close().await;
    assert!(!manager.healthcheck().await);
}

// ============================================================================
// Bootstrap and close
// ============================================================================

#[tokio::test]
async fn test_bootstrap_retries_transient_open_failures() {
    let (manager, shared) = manager(1, Duration::from_secs(1));
    shared.failing_opens.store(2, Ordering::SeqCst);

    lease_id(&manager).await.unwrap();
    assert_eq!(shared.opens.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_bootstrap_can_be_retried_later() {
    let (manager, shared) = manager(1, Duration::from_secs(1));
    shared.failing_opens.store(3, Ordering::SeqCst);

    let err = lease_id(&manager).await.unwrap_err();
    assert!(matches!(err, DbError::Pool(PoolError::Bootstrap(_))), "unexpected error: {err}");
    assert!(!manager.status().ready);

    lease_id(&manager).await.unwrap();
    assert!(manager.status().ready);
}

#[tokio::test]
async fn test_close_releases_everything_and_rejects_callers() {
    let (manager, shared) = manager(3, Duration::from_secs(1));
    lease_id(&manager).await.unwrap();

    manager.close().await;
    manager.close().await;

    assert_eq!(shared.shutdowns.load(Ordering::SeqCst), 3);
    assert_eq!(shared.closes.load(Ordering::SeqCst), 1);
    let err = lease_id(&manager).await.unwrap_err();
    assert!(matches!(err, DbError::Pool(PoolError::Closed)), "unexpected error: {err}");
}

#[tokio::test]
async fn test_close_rejects_queued_waiters() {
    let (manager, _shared) = manager(1, Duration::from_secs(5));
    let leased = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let holder = hold_lease(&manager, Arc::clone(&leased), Arc::clone(&release));
    leased.notified().await;

    let waiter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { lease_id(&manager).await })
    };
    wait_for_waiters(&manager, 1).await;

    manager.close().await;
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, DbError::Pool(PoolError::Closed)), "unexpected error: {err}");

    release.notify_one();
    holder.await.unwrap().unwrap();
}

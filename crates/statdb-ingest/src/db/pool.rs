//! Connection pool manager
//!
//! A [`ConnectionManager`] owns `size` connections opened from one database
//! instance and leases them to callers of [`ConnectionManager::with_connection`].
//!
//! # Lifecycle
//!
//! `uninitialized -> ready -> closed`. The first operation bootstraps the pool;
//! concurrent first callers queue behind the same lifecycle lock and find the
//! pool ready once the winner is done. A failed bootstrap leaves the manager
//! uninitialized so a later call can try again.
//!
//! # Leasing
//!
//! Free connections are handed out round-robin. When none is free the caller
//! joins a FIFO queue and waits at most `acquire_timeout`. Releases hand the
//! connection straight to the oldest waiter, under the pool lock, so a waiter
//! whose timer already fired never ends up owning a lease.
//!
//! # Recovery
//!
//! When an operation fails, the same connection is pinged with `SELECT 1`:
//!
//! - ping succeeds: the error belongs to the operation and is returned as is
//! - ping fails: the pool is torn down and bootstrapped again, then the
//!   operation is retried exactly once on a fresh lease
//!
//! Recoveries are serialized. Every lease carries the pool generation it came
//! from; a caller whose broken lease is older than the current generation
//! skips recreation because somebody else already rebuilt the pool.

use crate::db::bootstrap::bootstrap_pool;
use crate::db::DbError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use statdb_common::retry::BackoffPolicy;
use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default number of pooled connections
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default time a caller may wait for a free connection
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// A single pooled connection
#[async_trait]
pub trait PoolConnection: Send + Sized + 'static {
    /// Cheap, side-effect free round trip
    async fn ping(&mut self) -> Result<(), DbError>;

    /// Close the connection, swallowing errors
    async fn shutdown(self);
}

/// Opens database instances and connections for a [`ConnectionManager`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Database: Send + Sync + 'static;
    type Connection: PoolConnection;

    /// Open (or create) the database instance
    async fn open(&self) -> Result<Self::Database, DbError>;

    /// Open one more connection to an opened instance
    async fn connect(&self, database: &Self::Database) -> Result<Self::Connection, DbError>;

    /// Release the database instance
    async fn close(&self, database: Self::Database);
}

/// Errors raised by the pool itself, never by the caller's operation
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Timed out after {waited_ms} ms waiting for one of {pool_size} pooled connections")]
    AcquireTimeout { waited_ms: u64, pool_size: usize },

    #[error("Connection manager is closed")]
    Closed,

    #[error("Connection pool was recreated while waiting for a lease")]
    Reset,

    #[error("Failed to open the database pool: {0}")]
    Bootstrap(#[source] Box<DbError>),
}

/// Pool sizing and timing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub acquire_timeout: Duration,
    pub bootstrap: BackoffPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_POOL_SIZE,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            bootstrap: BackoffPolicy::default(),
        }
    }
}

/// Point-in-time view of the pool, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub leased: usize,
    pub waiting: usize,
    pub generation: u64,
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    Ready,
    Closed,
}

struct Slot<Conn> {
    conn: Option<Conn>,
    leased: bool,
}

struct Lease<Conn> {
    slot: usize,
    generation: u64,
    conn: Conn,
}

struct Waiter<Conn> {
    id: u64,
    tx: oneshot::Sender<Lease<Conn>>,
}

struct PoolState<C: Connector> {
    phase: Phase,
    database: Option<C::Database>,
    slots: Vec<Slot<C::Connection>>,
    waiters: VecDeque<Waiter<C::Connection>>,
    generation: u64,
    cursor: usize,
    next_waiter_id: u64,
}

type Teardown<C> = (Option<<C as Connector>::Database>, Vec<<C as Connector>::Connection>);

impl<C: Connector> PoolState<C> {
    fn new() -> Self {
        Self {
            phase: Phase::Uninitialized,
            database: None,
            slots: Vec::new(),
            waiters: VecDeque::new(),
            generation: 0,
            cursor: 0,
            next_waiter_id: 0,
        }
    }

    fn take_free(&mut self) -> Option<Lease<C::Connection>> {
        let len = self.slots.len();
        for offset in 0..len {
            let index = (self.cursor + offset) % len;
            let slot = &mut self.slots[index];
            if slot.leased {
                continue;
            }
            if let Some(conn) = slot.conn.take() {
                slot.leased = true;
                self.cursor = (index + 1) % len;
                return Some(Lease {
                    slot: index,
                    generation: self.generation,
                    conn,
                });
            }
        }
        None
    }

    /// Hand a lease to the oldest live waiter, or park it in its slot.
    ///
    /// Returns the connection when it no longer belongs to this pool.
    fn release(&mut self, mut lease: Lease<C::Connection>) -> Option<C::Connection> {
        if self.phase != Phase::Ready || lease.generation != self.generation {
            return Some(lease.conn);
        }

        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(lease) {
                Ok(()) => return None,
                // receiver gone: its caller timed out and is unwinding
                Err(returned) => lease = returned,
            }
        }

        match self.slots.get_mut(lease.slot) {
            Some(slot) => {
                slot.conn = Some(lease.conn);
                slot.leased = false;
                None
            },
            None => Some(lease.conn),
        }
    }

    fn install(&mut self, database: C::Database, connections: Vec<C::Connection>) {
        self.database = Some(database);
        self.slots = connections
            .into_iter()
            .map(|conn| Slot {
                conn: Some(conn),
                leased: false,
            })
            .collect();
        self.cursor = 0;
        self.phase = Phase::Ready;

        while !self.waiters.is_empty() {
            let Some(lease) = self.take_free() else {
                break;
            };
            drop(self.release(lease));
        }
    }

    /// Detach everything the pool owns; dropping the waiters rejects them
    fn dismantle(&mut self) -> Teardown<C> {
        self.waiters.clear();
        let connections = self.slots.drain(..).filter_map(|slot| slot.conn).collect();
        (self.database.take(), connections)
    }
}

/// Leases pooled connections and recovers the pool when the transport dies
pub struct ConnectionManager<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<PoolState<C>>,
    lifecycle: tokio::sync::Mutex<()>,
}

/// A lease that goes back to the pool when dropped
struct Leased<'m, C: Connector> {
    manager: &'m ConnectionManager<C>,
    lease: Option<Lease<C::Connection>>,
}

impl<C: Connector> Leased<'_, C> {
    fn generation(&self) -> u64 {
        self.lease.as_ref().map_or(0, |lease| lease.generation)
    }

    fn connection(&mut self) -> &mut C::Connection {
        match self.lease.as_mut() {
            Some(lease) => &mut lease.conn,
            None => unreachable!("a lease keeps its connection until dropped"),
        }
    }
}

impl<C: Connector> Drop for Leased<'_, C> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let stale = self.manager.lock().release(lease);
            if stale.is_some() {
                debug!("Dropped connection from a retired pool generation");
            }
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager; nothing is opened until the first operation
    pub fn new(connector: C, config: PoolConfig) -> Self {
        Self {
            connector,
            config,
            state: Mutex::new(PoolState::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current lease state
    pub fn status(&self) -> PoolStatus {
        let state = self.lock();
        PoolStatus {
            size: state.slots.len(),
            leased: state.slots.iter().filter(|slot| slot.leased).count(),
            waiting: state.waiters.len(),
            generation: state.generation,
            ready: state.phase == Phase::Ready,
        }
    }

    /// Run `operation` on a leased connection
    ///
    /// Operation errors on a healthy connection are returned unchanged and
    /// never retried. If the connection fails its ping as well, the pool is
    /// recreated and the operation runs once more; that second result is
    /// returned whatever it is.
    pub async fn with_connection<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: for<'c> FnMut(&'c mut C::Connection) -> BoxFuture<'c, Result<T, E>> + Send,
        E: From<PoolError> + Display + Send,
        T: Send,
    {
        self.ensure_ready().await?;
        let mut leased = self.acquire().await?;

        let err = match operation(leased.connection()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let ping = leased.connection().ping().await;
        let Err(ping_err) = ping else {
            return Err(err);
        };

        warn!(
            error = %err,
            ping_error = %ping_err,
            generation = leased.generation(),
            "Pooled connection failed its health check, recreating the pool"
        );

        let failed_generation = leased.generation();
        self.recover(failed_generation).await?;
        drop(leased);

        let mut retry = self.acquire().await?;
        let result = operation(retry.connection()).await;
        if let Err(retry_err) = &result {
            warn!(error = %retry_err, "Operation failed again after pool recovery");
        }
        result
    }

    /// `SELECT 1` through a leased connection; errors are logged, not returned
    pub async fn healthcheck(&self) -> bool {
        let result: Result<(), DbError> = self
            .with_connection(|conn| Box::pin(async move { conn.ping().await }))
            .await;

        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Database healthcheck failed");
                false
            },
        }
    }

    /// Reject waiters, close every connection and the database instance
    pub async fn close(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let (database, connections) = {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.dismantle()
        };

        self.teardown(database, connections).await;
        info!("Connection manager closed");
    }

    async fn ensure_ready(&self) -> Result<(), PoolError> {
        let phase = self.lock().phase;
        match phase {
            Phase::Ready => return Ok(()),
            Phase::Closed => return Err(PoolError::Closed),
            Phase::Uninitialized => {},
        }

        let _lifecycle = self.lifecycle.lock().await;
        let phase = self.lock().phase;
        match phase {
            Phase::Ready => return Ok(()),
            Phase::Closed => return Err(PoolError::Closed),
            Phase::Uninitialized => {},
        }

        let (database, connections) = self.build().await?;
        let leftover = {
            let mut state = self.lock();
            if state.phase == Phase::Closed {
                Some((database, connections))
            } else {
                state.install(database, connections);
                None
            }
        };

        if let Some((database, connections)) = leftover {
            self.teardown(Some(database), connections).await;
            return Err(PoolError::Closed);
        }

        info!(pool_size = self.config.size, "Connection pool ready");
        Ok(())
    }

    async fn acquire(&self) -> Result<Leased<'_, C>, PoolError> {
        let (waiter_id, mut rx) = {
            let mut state = self.lock();
            match state.phase {
                Phase::Closed => return Err(PoolError::Closed),
                Phase::Uninitialized => return Err(PoolError::Reset),
                Phase::Ready => {},
            }

            if let Some(lease) = state.take_free() {
                return Ok(Leased {
                    manager: self,
                    lease: Some(lease),
                });
            }

            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (id, rx)
        };

        let started = Instant::now();
        match tokio::time::timeout(self.config.acquire_timeout, &mut rx).await {
            Ok(Ok(lease)) => Ok(Leased {
                manager: self,
                lease: Some(lease),
            }),
            Ok(Err(_)) => {
                let phase = self.lock().phase;
                if phase == Phase::Closed {
                    Err(PoolError::Closed)
                } else {
                    Err(PoolError::Reset)
                }
            },
            Err(_) => {
                let mut state = self.lock();
                state.waiters.retain(|waiter| waiter.id != waiter_id);
                // a release may have won the race against the timer
                if let Ok(lease) = rx.try_recv() {
                    drop(state.release(lease));
                }
                let pool_size = state.slots.len();
                drop(state);

                let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                warn!(waited_ms, pool_size, "Timed out waiting for a pooled connection");
                Err(PoolError::AcquireTimeout {
                    waited_ms,
                    pool_size,
                })
            },
        }
    }

    async fn recover(&self, failed_generation: u64) -> Result<(), PoolError> {
        let _lifecycle = self.lifecycle.lock().await;

        let (database, connections) = {
            let mut state = self.lock();
            match state.phase {
                Phase::Closed => return Err(PoolError::Closed),
                Phase::Uninitialized => {},
                Phase::Ready if state.generation != failed_generation => {
                    debug!(
                        failed_generation,
                        current_generation = state.generation,
                        "Pool already recreated by another caller"
                    );
                    return Ok(());
                },
                Phase::Ready => {},
            }
            state.generation += 1;
            state.dismantle()
        };

        self.teardown(database, connections).await;

        let built = self.build().await;
        let (database, connections) = {
            let mut state = self.lock();
            match built {
                Ok((database, connections)) if state.phase != Phase::Closed => {
                    state.install(database, connections);
                    info!(generation = state.generation, "Connection pool recreated");
                    return Ok(());
                },
                Ok(closed_meanwhile) => closed_meanwhile,
                Err(err) => {
                    if state.phase != Phase::Closed {
                        state.phase = Phase::Uninitialized;
                    }
                    return Err(err);
                },
            }
        };

        self.teardown(Some(database), connections).await;
        Err(PoolError::Closed)
    }

    async fn build(&self) -> Result<(C::Database, Vec<C::Connection>), PoolError> {
        bootstrap_pool(&self.connector, self.config.size, &self.config.bootstrap)
            .await
            .map_err(|err| PoolError::Bootstrap(Box::new(err)))
    }

    async fn teardown(&self, database: Option<C::Database>, connections: Vec<C::Connection>) {
        for conn in connections {
            conn.shutdown().await;
        }
        if let Some(database) = database {
            self.connector.close(database).await;
        }
    }
}

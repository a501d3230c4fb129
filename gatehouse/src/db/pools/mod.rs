//! Adaptive connection pool.
//!
//! [`ConnectionPoolManager`] hands out leases on database connections and resizes itself from
//! observed utilization. It is generic over a [`Connector`], so the sizing and health logic is
//! exercised in tests without a database; [`PgConnector`] is the production connector.
//!
//! # Lease lifecycle
//!
//! ```text
//!            lease()                 drop (healthy, fresh)
//!   IDLE ──────────────→ LEASED ──────────────────────────→ IDLE
//!     │                    │
//!     │ stale / ping fails │ drop (broken, stale, or over target)
//!     ↓                    ↓
//!  RETIRED ←───────────────┘
//! ```
//!
//! A lease holds one permit of a `tokio::sync::Semaphore` whose permit count is the target pool
//! size, so at most `size()` connections are ever leased at once. Waiting for a permit is bounded
//! by `pool.acquire_timeout`, after which the caller gets [`Error::PoolExhausted`].
//!
//! # Resizing
//!
//! Growing adds permits. Shrinking forgets free permits; any shortfall is recorded as debt that
//! returning leases repay by forgetting their permit instead of releasing it. Idle connections
//! never hold permits, so shrinking also closes idle connections above the new target.
//!
//! Sizing decisions come from [`ConnectionPoolManager::reassess_now`], driven by the
//! background loop in [`metrics`].

pub mod metrics;

use async_trait::async_trait;
use sqlx::{Connection, PgConnection, postgres::PgConnectOptions};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::PoolConfig;
use crate::errors::{Error, Result};

pub use self::metrics::{PoolMetricsSnapshot, SizingDecision, run_pool_maintenance};

/// Opens, checks and closes connections for a [`ConnectionPoolManager`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> anyhow::Result<Self::Connection>;

    /// Cheap liveness probe run on an idle connection before it is leased
    async fn is_healthy(&self, conn: &mut Self::Connection) -> bool;

    async fn close(&self, conn: Self::Connection);
}

/// Opens raw `PgConnection`s.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let options = PgConnectOptions::from_str(url)?;
        Ok(Self { options })
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Connection = PgConnection;

    async fn connect(&self) -> anyhow::Result<PgConnection> {
        Ok(PgConnection::connect_with(&self.options).await?)
    }

    async fn is_healthy(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!("Error closing retired connection: {}", e);
        }
    }
}

struct Slot<T> {
    conn: T,
    id: u64,
    created_at: Instant,
    last_used: Instant,
}

struct PoolState<T> {
    idle: VecDeque<Slot<T>>,
    /// Target size; equals the semaphore's permits net of `shrink_debt`
    target: usize,
    /// Permits still to be forgotten as leases come back
    shrink_debt: usize,
}

pub(crate) struct PoolInner<C: Connector> {
    connector: Arc<C>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState<C::Connection>>,
    leased: AtomicUsize,
    waiters: AtomicUsize,
    next_id: AtomicU64,
    closed: AtomicBool,
    reassessing: AtomicBool,
    pub(crate) metrics: self::metrics::PoolMetrics,
}

/// Handle to an adaptive pool. Cheap to clone.
pub struct ConnectionPoolManager<C: Connector> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> Clone for ConnectionPoolManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Decrements a counter when dropped, so cancelled waits are still accounted for
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C: Connector> ConnectionPoolManager<C> {
    /// Build a pool sized from the host's available parallelism.
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::with_initial_size(connector, config, config.initial_size_for(cores))
    }

    /// Build a pool with an explicit starting size (clamped to floor/ceiling).
    pub fn with_initial_size(connector: C, config: &PoolConfig, initial: usize) -> Self {
        let target = initial.clamp(config.floor, config.ceiling);
        info!(
            target,
            floor = config.floor,
            ceiling = config.ceiling,
            "Creating adaptive connection pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                connector: Arc::new(connector),
                config: config.clone(),
                semaphore: Arc::new(Semaphore::new(target)),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    target,
                    shrink_debt: 0,
                }),
                leased: AtomicUsize::new(0),
                waiters: AtomicUsize::new(0),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                reassessing: AtomicBool::new(false),
                metrics: self::metrics::PoolMetrics::new(config.metrics_retention),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn connector(&self) -> &C {
        &self.inner.connector
    }

    /// Current target size
    pub fn size(&self) -> usize {
        self.inner.lock_state().target
    }

    /// Connections currently leased out
    pub fn active(&self) -> usize {
        self.inner.leased.load(Ordering::SeqCst)
    }

    /// Open connections waiting on the idle list
    pub fn idle(&self) -> usize {
        self.inner.lock_state().idle.len()
    }

    /// Callers currently blocked in [`lease`](Self::lease)
    pub fn waiters(&self) -> usize {
        self.inner.waiters.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Lease a connection, waiting at most `pool.acquire_timeout` in total for capacity and
    /// for the connection itself.
    #[instrument(skip(self), err)]
    pub async fn lease(&self) -> Result<PooledConnection<C>> {
        if self.is_closed() {
            return Err(Error::StoreUnavailable {
                operation: "lease from closed pool".to_string(),
            });
        }

        let started = Instant::now();
        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(_) => {
                let _waiting = CountGuard::enter(&self.inner.waiters);
                tokio::time::timeout(self.inner.config.acquire_timeout, self.inner.semaphore.clone().acquire_owned())
                    .await
                    .map_err(|_| ())
                    .and_then(|acquired| acquired.map_err(|_| ()))
            }
        };

        let permit = match permit {
            Ok(permit) => permit,
            Err(()) if self.is_closed() => {
                return Err(Error::StoreUnavailable {
                    operation: "lease from closed pool".to_string(),
                });
            }
            Err(()) => {
                let waited = started.elapsed();
                ::metrics::counter!("gatehouse_pool_exhausted_total").increment(1);
                warn!(?waited, size = self.size(), "Connection pool exhausted");
                return Err(Error::PoolExhausted { waited });
            }
        };
        self.inner.metrics.record_wait(started.elapsed());

        // Health checks and connects share what is left of the acquire budget
        let remaining = self.inner.config.acquire_timeout.saturating_sub(started.elapsed());
        let slot = match tokio::time::timeout(remaining, self.inner.checkout()).await {
            Ok(slot) => slot?,
            Err(_) => {
                let waited = started.elapsed();
                warn!(?waited, "Timed out checking out a pooled connection");
                return Err(Error::StoreUnavailable {
                    operation: "open pooled connection: timed out".to_string(),
                });
            }
        };
        self.inner.leased.fetch_add(1, Ordering::SeqCst);

        Ok(PooledConnection {
            slot: Some(slot),
            permit: Some(permit),
            pool: self.inner.clone(),
            broken: false,
        })
    }

    /// Open connections until `min(floor, size())` exist. Returns how many were opened.
    pub async fn warm_up(&self) -> anyhow::Result<usize> {
        let wanted = {
            let state = self.inner.lock_state();
            let open = state.idle.len() + self.active();
            self.inner.config.floor.min(state.target).saturating_sub(open)
        };

        let mut opened = 0;
        for _ in 0..wanted {
            let conn = self.inner.connector.connect().await?;
            let slot = self.inner.new_slot(conn);
            let mut state = self.inner.lock_state();
            if state.idle.len() + self.active() >= state.target {
                drop(state);
                self.inner.retire(slot);
                break;
            }
            state.idle.push_back(slot);
            opened += 1;
        }

        if opened > 0 {
            debug!(opened, "Warmed up connection pool");
        }
        Ok(opened)
    }

    /// Retire idle connections past their lifetime or idle timeout. Returns how many were retired.
    pub fn recycle_idle(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<Slot<C::Connection>> = {
            let mut state = self.inner.lock_state();
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(&mut state.idle).into_iter().partition(|slot| self.inner.is_stale(slot, now));
            state.idle = fresh;
            stale.into_iter().collect()
        };

        let retired = stale.len();
        for slot in stale {
            self.inner.retire(slot);
        }
        if retired > 0 {
            debug!(retired, "Recycled stale idle connections");
        }
        retired
    }

    /// Set a new target size, clamped to floor/ceiling. Returns the size actually applied.
    pub fn resize(&self, requested: usize) -> usize {
        let config = &self.inner.config;
        let new_target = requested.clamp(config.floor, config.ceiling);

        let surplus: Vec<Slot<C::Connection>> = {
            let mut state = self.inner.lock_state();
            let old_target = state.target;

            if new_target > old_target {
                let grow = new_target - old_target;
                let repaid = grow.min(state.shrink_debt);
                state.shrink_debt -= repaid;
                self.inner.semaphore.add_permits(grow - repaid);
            } else if new_target < old_target {
                let shrink = old_target - new_target;
                let forgotten = self.inner.semaphore.forget_permits(shrink);
                state.shrink_debt += shrink - forgotten;
            }
            state.target = new_target;

            let excess = state.idle.len().saturating_sub(new_target);
            state.idle.drain(..excess).collect()
        };

        for slot in surplus {
            self.inner.retire(slot);
        }
        ::metrics::gauge!("gatehouse_pool_size").set(new_target as f64);
        new_target
    }

    /// Stop handing out leases and close all idle connections. Outstanding leases are closed
    /// as they are dropped.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.semaphore.close();

        let idle: Vec<Slot<C::Connection>> = self.inner.lock_state().idle.drain(..).collect();
        let count = idle.len();
        for slot in idle {
            self.inner.connector.close(slot.conn).await;
        }
        info!(closed = count, "Connection pool closed");
    }
}

impl<C: Connector> PoolInner<C> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Connection>> {
        // A panic while holding this lock cannot leave the idle list inconsistent, so recover
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_slot(&self, conn: C::Connection) -> Slot<C::Connection> {
        let now = Instant::now();
        Slot {
            conn,
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            created_at: now,
            last_used: now,
        }
    }

    fn is_stale(&self, slot: &Slot<C::Connection>, now: Instant) -> bool {
        now.duration_since(slot.created_at) >= self.config.max_lifetime
            || now.duration_since(slot.last_used) >= self.config.idle_timeout
    }

    /// Take a healthy idle connection, or open a new one.
    async fn checkout(&self) -> Result<Slot<C::Connection>> {
        loop {
            let candidate = self.lock_state().idle.pop_back();
            let Some(mut slot) = candidate else {
                break;
            };

            if self.is_stale(&slot, Instant::now()) {
                self.retire(slot);
                continue;
            }
            if self.connector.is_healthy(&mut slot.conn).await {
                return Ok(slot);
            }
            debug!(connection_id = slot.id, "Idle connection failed health check");
            self.retire(slot);
        }

        match self.connector.connect().await {
            Ok(conn) => Ok(self.new_slot(conn)),
            Err(e) => {
                warn!("Failed to open pooled connection: {:#}", e);
                Err(Error::StoreUnavailable {
                    operation: "open pooled connection".to_string(),
                })
            }
        }
    }

    /// Close a connection off the request path.
    fn retire(&self, slot: Slot<C::Connection>) {
        ::metrics::counter!("gatehouse_pool_connections_retired_total").increment(1);
        debug!(connection_id = slot.id, "Retiring connection");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let connector = self.connector.clone();
                let conn = slot.conn;
                handle.spawn(async move { connector.close(conn).await });
            }
            // Outside a runtime (e.g. during shutdown) the connection is simply dropped
            Err(_) => drop(slot),
        }
    }

    /// Return a leased connection
    fn release(&self, mut slot: Slot<C::Connection>, permit: Option<OwnedSemaphorePermit>, broken: bool) {
        let now = Instant::now();
        slot.last_used = now;

        let retire = {
            let mut state = self.lock_state();

            if let Some(permit) = permit {
                if state.shrink_debt > 0 {
                    state.shrink_debt -= 1;
                    permit.forget();
                } else {
                    drop(permit);
                }
            }

            if broken || self.closed.load(Ordering::SeqCst) || self.is_stale(&slot, now) || state.idle.len() >= state.target {
                Some(slot)
            } else {
                state.idle.push_back(slot);
                None
            }
        };

        if let Some(slot) = retire {
            self.retire(slot);
        }
    }
}

/// A leased connection. Dereferences to the underlying connection and returns it to the pool
/// when dropped, including when the holding future is cancelled.
pub struct PooledConnection<C: Connector> {
    slot: Option<Slot<C::Connection>>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner<C>>,
    broken: bool,
}

impl<C: Connector> PooledConnection<C> {
    /// Do not return this connection to the idle list
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Identifier of the underlying connection, stable across leases
    pub fn connection_id(&self) -> u64 {
        self.slot.as_ref().map(|slot| slot.id).unwrap_or_default()
    }
}

impl<C: Connector> Deref for PooledConnection<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // The slot is only taken in Drop
        match &self.slot {
            Some(slot) => &slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.slot {
            Some(slot) => &mut slot.conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.leased.fetch_sub(1, Ordering::SeqCst);
            self.pool.release(slot, self.permit.take(), self.broken);
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection_id", &self.connection_id())
            .field("broken", &self.broken)
            .finish()
    }
}

/// Adaptive pool over Postgres connections
pub type PgConnectionPool = ConnectionPoolManager<PgConnector>;

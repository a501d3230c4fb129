//! Pool metrics sampling and adaptive sizing.
//!
//! The maintenance task started by [`run_pool_maintenance`] periodically samples pool state,
//! records gauges, recycles stale idle connections, and every `reassess_interval` decides
//! whether the pool should grow or shrink.
//!
//! Gauges recorded on every sample:
//! - `gatehouse_pool_size` - Current target size
//! - `gatehouse_pool_connections_active` - Connections leased out
//! - `gatehouse_pool_connections_idle` - Open connections on the idle list
//! - `gatehouse_pool_waiters` - Callers waiting for a lease
//! - `gatehouse_pool_utilization` - Leased share of open connections, `active / (active + idle)`
//! - `gatehouse_pool_wait_p95_seconds` - 95th percentile lease wait since the previous sample

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::{ConnectionPoolManager, Connector};

/// Lease wait samples kept between two snapshots
const MAX_WAIT_SAMPLES: usize = 4096;

/// Point-in-time view of the pool. Immutable once taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PoolMetricsSnapshot {
    /// Monotonic sample number
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    /// Target size
    pub size: usize,
    pub active: usize,
    pub idle: usize,
    pub waiters: usize,
    pub wait_p95_ms: u64,
    /// `active / size`, capped at 1.0
    pub utilization: f64,
}

/// Outcome of one reassessment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SizingDecision {
    Grow { from: usize, to: usize },
    Shrink { from: usize, to: usize },
    /// Samples were mixed, absent, or the pool is already at the relevant bound
    Hold { size: usize },
    /// Another reassessment was in progress
    AlreadyRunning,
}

pub(crate) struct PoolMetrics {
    retention: usize,
    waits: Mutex<Vec<Duration>>,
    history: Mutex<VecDeque<PoolMetricsSnapshot>>,
    seq: AtomicU64,
    /// Highest sample number already consumed by a sizing decision
    last_decision_seq: AtomicU64,
}

impl PoolMetrics {
    pub(crate) fn new(retention: usize) -> Self {
        Self {
            retention: retention.max(1),
            waits: Mutex::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            seq: AtomicU64::new(0),
            last_decision_seq: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_wait(&self, waited: Duration) {
        let mut waits = self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if waits.len() < MAX_WAIT_SAMPLES {
            waits.push(waited);
        }
    }

    fn wait_p95(&self, drain: bool) -> Duration {
        let mut waits = self.waits.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let p95 = percentile_95(&waits);
        if drain {
            waits.clear();
        }
        p95
    }

    fn push(&self, snapshot: PoolMetricsSnapshot) {
        let mut history = self.history.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        while history.len() >= self.retention {
            history.pop_front();
        }
        history.push_back(snapshot);
    }

    fn history(&self) -> Vec<PoolMetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn since(&self, seq: u64) -> Vec<PoolMetricsSnapshot> {
        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.seq > seq)
            .cloned()
            .collect()
    }
}

fn percentile_95(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_unstable();
    let rank = (sorted.len() * 95).div_ceil(100);
    sorted[rank.saturating_sub(1)]
}

impl<C: Connector> ConnectionPoolManager<C> {
    fn build_snapshot(&self, seq: u64, drain_waits: bool) -> PoolMetricsSnapshot {
        let (size, idle) = {
            let state = self.inner.lock_state();
            (state.target, state.idle.len())
        };
        let active = self.active();
        // Share of open connections in use; an empty pool is idle
        let open = active + idle;
        let utilization = if open == 0 { 0.0 } else { active as f64 / open as f64 };

        PoolMetricsSnapshot {
            seq,
            taken_at: Utc::now(),
            size,
            active,
            idle,
            waiters: self.waiters(),
            wait_p95_ms: u64::try_from(self.inner.metrics.wait_p95(drain_waits).as_millis()).unwrap_or(u64::MAX),
            utilization,
        }
    }

    /// Current state without recording it
    pub fn snapshot(&self) -> PoolMetricsSnapshot {
        self.build_snapshot(self.inner.metrics.seq.load(Ordering::SeqCst), false)
    }

    /// Take a snapshot, append it to the history and publish gauges.
    pub fn sample(&self) -> PoolMetricsSnapshot {
        let seq = self.inner.metrics.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.build_snapshot(seq, true);

        gauge!("gatehouse_pool_size").set(snapshot.size as f64);
        gauge!("gatehouse_pool_connections_active").set(snapshot.active as f64);
        gauge!("gatehouse_pool_connections_idle").set(snapshot.idle as f64);
        gauge!("gatehouse_pool_waiters").set(snapshot.waiters as f64);
        gauge!("gatehouse_pool_utilization").set(snapshot.utilization);
        gauge!("gatehouse_pool_wait_p95_seconds").set(snapshot.wait_p95_ms as f64 / 1000.0);

        debug!(
            size = snapshot.size,
            active = snapshot.active,
            idle = snapshot.idle,
            waiters = snapshot.waiters,
            utilization = snapshot.utilization,
            "Sampled pool metrics"
        );

        self.inner.metrics.push(snapshot.clone());
        snapshot
    }

    /// Retained snapshots, oldest first
    pub fn history(&self) -> Vec<PoolMetricsSnapshot> {
        self.inner.metrics.history()
    }

    /// Decide on and apply a size change from the samples taken since the previous decision.
    ///
    /// Grows by `step` when every sample is above the high watermark and shrinks by `step` when
    /// every sample is below the low watermark. Only one reassessment runs at a time.
    pub fn reassess_now(&self) -> SizingDecision {
        if self
            .inner
            .reassessing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return SizingDecision::AlreadyRunning;
        }

        let decision = self.decide_and_apply();
        self.inner.reassessing.store(false, Ordering::SeqCst);
        decision
    }

    fn decide_and_apply(&self) -> SizingDecision {
        let config = &self.inner.config;
        let metrics = &self.inner.metrics;
        let samples = metrics.since(metrics.last_decision_seq.load(Ordering::SeqCst));
        let current = self.size();

        let Some(latest) = samples.last().map(|s| s.seq) else {
            return SizingDecision::Hold { size: current };
        };
        metrics.last_decision_seq.store(latest, Ordering::SeqCst);

        let all_high = samples.iter().all(|s| s.utilization > config.high_watermark);
        let all_low = samples.iter().all(|s| s.utilization < config.low_watermark);

        let decision = if all_high && current < config.ceiling {
            let to = self.resize(current.saturating_add(config.step));
            SizingDecision::Grow { from: current, to }
        } else if all_low && current > config.floor {
            let to = self.resize(current.saturating_sub(config.step));
            SizingDecision::Shrink { from: current, to }
        } else {
            SizingDecision::Hold { size: current }
        };

        match decision {
            SizingDecision::Grow { from, to } | SizingDecision::Shrink { from, to } => {
                info!(from, to, samples = samples.len(), "Resized connection pool");
            }
            _ => debug!(size = current, samples = samples.len(), "Connection pool size unchanged"),
        }
        decision
    }
}

/// Run pool sampling, idle recycling and periodic resizing until `shutdown` fires.
pub async fn run_pool_maintenance<C: Connector>(pool: ConnectionPoolManager<C>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let sample_interval = pool.config().sample_interval;
    let reassess_interval = pool.config().reassess_interval;
    info!(
        "Starting pool maintenance with {:?} sample interval and {:?} reassess interval",
        sample_interval, reassess_interval
    );

    if let Err(e) = pool.warm_up().await {
        warn!("Initial pool warm-up failed: {:#}", e);
    }

    let mut sample_tick = tokio::time::interval(sample_interval);
    sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut reassess_tick = tokio::time::interval_at(tokio::time::Instant::now() + reassess_interval, reassess_interval);
    reassess_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Pool maintenance shutting down");
                break;
            }
            _ = sample_tick.tick() => {
                pool.sample();
                pool.recycle_idle();
                if let Err(e) = pool.warm_up().await {
                    warn!("Failed to replenish pool to floor: {:#}", e);
                }
            }
            _ = reassess_tick.tick() => {
                pool.reassess_now();
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::test_utils::FakeConnector;

    fn config() -> PoolConfig {
        PoolConfig {
            floor: 2,
            ceiling: 8,
            step: 2,
            high_watermark: 0.8,
            low_watermark: 0.3,
            metrics_retention: 5,
            acquire_timeout: Duration::from_millis(50),
            sample_interval: Duration::from_secs(10),
            reassess_interval: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[test]
    fn test_percentile_95() {
        assert_eq!(percentile_95(&[]), Duration::ZERO);
        let samples: Vec<_> = (1..=100).map(Duration::from_millis).collect();
        assert_eq!(percentile_95(&samples), Duration::from_millis(95));
        assert_eq!(percentile_95(&[Duration::from_millis(7)]), Duration::from_millis(7));
    }

    #[tokio::test]
    async fn test_grows_when_every_sample_is_hot() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 4);
        let leases = futures::future::join_all((0..4).map(|_| pool.lease())).await;
        for _ in 0..3 {
            assert_eq!(pool.sample().utilization, 1.0);
        }

        assert_eq!(pool.reassess_now(), SizingDecision::Grow { from: 4, to: 6 });
        assert_eq!(pool.size(), 6);
        drop(leases);
    }

    #[tokio::test]
    async fn test_shrinks_when_every_sample_is_cold() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 6);
        pool.sample();
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Shrink { from: 6, to: 4 });
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Shrink { from: 4, to: 2 });
        pool.sample();
        // Floor reached
        assert_eq!(pool.reassess_now(), SizingDecision::Hold { size: 2 });
    }

    #[tokio::test]
    async fn test_utilization_is_share_of_open_connections() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 8);
        assert_eq!(pool.sample().utilization, 0.0);

        let first = pool.lease().await.unwrap();
        let second = pool.lease().await.unwrap();
        drop(second);
        // One leased, one idle, six never opened
        let snapshot = pool.sample();
        assert_eq!((snapshot.active, snapshot.idle), (1, 1));
        assert_eq!(snapshot.utilization, 0.5);
        drop(first);
    }

    #[tokio::test]
    async fn test_mixed_samples_hold() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 4);
        pool.sample();
        let leases = futures::future::join_all((0..4).map(|_| pool.lease())).await;
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Hold { size: 4 });
        drop(leases);
    }

    #[tokio::test]
    async fn test_only_new_samples_count() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 4);
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Shrink { from: 4, to: 2 });
        // No samples since the last decision
        assert_eq!(pool.reassess_now(), SizingDecision::Hold { size: 2 });
    }

    #[tokio::test]
    async fn test_ceiling_respected() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 7);
        let leases = futures::future::join_all((0..7).map(|_| pool.lease())).await;
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Grow { from: 7, to: 8 });
        pool.sample();
        assert_eq!(pool.reassess_now(), SizingDecision::Hold { size: 8 });
        drop(leases);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 4);
        for _ in 0..12 {
            pool.sample();
        }
        let history = pool.history();
        assert_eq!(history.len(), 5);
        assert_eq!(history.first().unwrap().seq, 8);
        assert_eq!(history.last().unwrap().seq, 12);
    }

    #[tokio::test]
    async fn test_sample_reports_lease_waits() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 2);
        drop(pool.lease().await.unwrap());
        let snapshot = pool.sample();
        assert_eq!(snapshot.active, 0);
        assert_eq!(snapshot.idle, 1);
        assert_eq!(snapshot.size, 2);
        // Waits are consumed by the sample
        assert_eq!(pool.snapshot().wait_p95_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_runs_and_shuts_down() {
        let pool = ConnectionPoolManager::with_initial_size(FakeConnector::default(), &config(), 4);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_pool_maintenance(pool.clone(), shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(!handle.is_finished(), "Maintenance should still be running");
        assert!(pool.history().len() >= 3);
        // Floor connections were opened, and an idle pool shrank toward the floor
        assert_eq!(pool.size(), 2);
        assert!(pool.idle() >= 2);

        shutdown.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_ok(), "Maintenance should exit cleanly");
    }
}

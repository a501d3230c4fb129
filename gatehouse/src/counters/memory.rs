use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::{CounterStore, Result};

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Event timestamps for one key, oldest first.
#[derive(Debug)]
struct EventLog {
    times: VecDeque<Instant>,
    window: Duration,
}

impl EventLog {
    fn prune(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while self.times.front().is_some_and(|&t| t <= cutoff) {
            self.times.pop_front();
        }
    }
}

/// Process-local counter store.
///
/// Each key's read-modify-write runs under the map's shard lock, so concurrent increments on
/// the same key never lose updates. Uses tokio's clock so paused-time tests can drive expiry.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: DashMap<String, Entry>,
    events: DashMap<String, EventLog>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, counters and event logs together
    pub fn len(&self) -> usize {
        self.entries.len() + self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: Some(now + ttl),
        });
        if !entry.is_live(now) {
            *entry = Entry {
                value: 0,
                expires_at: Some(now + ttl),
            };
        }
        entry.value += delta;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        self.events.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn record_event(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut log = self.events.entry(key.to_string()).or_insert_with(|| EventLog {
            times: VecDeque::new(),
            window,
        });
        log.window = window;
        log.prune(now);
        log.times.push_back(now);
        Ok(log.times.len() as u64)
    }

    async fn count_events(&self, key: &str, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let Some(log) = self.events.get(key) else {
            return Ok(0);
        };
        let count = match now.checked_sub(window) {
            Some(cutoff) => log.times.iter().filter(|&&t| t > cutoff).count(),
            None => log.times.len(),
        };
        Ok(count as u64)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let before = self.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        self.events.retain(|_, log| {
            log.prune(now);
            !log.times.is_empty()
        });
        Ok(before.saturating_sub(self.len()))
    }
}

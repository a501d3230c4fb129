//! Shared atomic counters.
//!
//! Lockout failure counts and rate-limit windows live in a key-value store so that every
//! instance of the service sees the same numbers. Two backends implement [`CounterStore`]:
//!
//! - [`MemoryCounterStore`]: process-local, backed by a `DashMap`. Correct for a single
//!   instance and used throughout the test suite.
//! - [`RedisCounterStore`]: shared across instances. Increments run as a Lua script so the
//!   increment and the first-write expiry are one atomic step.
//!
//! Lockout failures use the event log operations instead of a counter, so the count always
//! covers exactly the trailing window.
//!
//! All operations are expected to complete in bounded time. Callers decide whether an error
//! fails open or closed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{CountersConfig, StoreBackend};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

#[derive(Debug, Error)]
pub enum CounterError {
    /// The backend could not be reached or returned a transport error
    #[error("counter backend unavailable: {0}")]
    Unavailable(String),

    /// The backend answered with something we cannot interpret
    #[error("unexpected counter backend response: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for CounterError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            CounterError::Unavailable(err.to_string())
        } else {
            CounterError::Protocol(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CounterError>;

/// Atomic integer counters with expiry.
#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Atomically add `delta` to `key` and return the new value.
    ///
    /// A key that does not exist (or has expired) starts from zero and is given `ttl`. The TTL of
    /// an existing key is left untouched, so a window keeps its original deadline.
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64>;

    /// Current value, or `None` if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remaining lifetime of `key`, or `None` if absent or without expiry.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Round trip to the backend.
    async fn ping(&self) -> Result<()>;

    /// Append an event to the log at `key` and return how many events fall inside the trailing
    /// `window`, this one included. Older events are discarded.
    async fn record_event(&self, key: &str, window: Duration) -> Result<u64>;

    /// Events logged at `key` within the trailing `window`.
    async fn count_events(&self, key: &str, window: Duration) -> Result<u64>;

    /// Reclaim storage held by expired keys. Backends that expire keys themselves have nothing
    /// to do.
    async fn purge_expired(&self) -> Result<usize> {
        Ok(0)
    }
}

/// Build the configured counter store.
pub async fn connect(config: &CountersConfig) -> anyhow::Result<Arc<dyn CounterStore>> {
    match config.backend {
        StoreBackend::Redis => {
            let store = RedisCounterStore::connect(config).await?;
            Ok(Arc::new(store))
        }
        _ => {
            tracing::info!("Using in-process counter store; lockout and rate limits are per instance");
            Ok(Arc::new(MemoryCounterStore::new()))
        }
    }
}

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{CounterError, CounterStore, Result};
use crate::config::CountersConfig;

/// INCRBY, then give the key an expiry if it has none. Runs atomically on the server.
const INCR_WITH_TTL: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return value
";

/// Log an event in a sorted set scored by server time, drop entries older than the window and
/// return the remaining count. ARGV: window in ms, unique member.
const RECORD_EVENT: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local window = tonumber(ARGV[1])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
redis.call('ZADD', KEYS[1], now, ARGV[2])
redis.call('PEXPIRE', KEYS[1], window)
return redis.call('ZCARD', KEYS[1])
";

/// Count sorted-set entries newer than the window. ARGV: window in ms.
const COUNT_EVENTS: &str = r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
return redis.call('ZCOUNT', KEYS[1], '(' .. (now - tonumber(ARGV[1])), '+inf')
";

const CONNECT_RETRIES: u32 = 3;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Redis-backed counter store shared by all instances.
///
/// Uses a `ConnectionManager` for automatic reconnection. All keys are prefixed with the
/// configured `key_prefix`.
#[derive(Clone)]
pub struct RedisCounterStore {
    manager: ConnectionManager,
    key_prefix: String,
    incr_script: redis::Script,
    record_event_script: redis::Script,
    count_events_script: redis::Script,
}

impl RedisCounterStore {
    pub async fn connect(config: &CountersConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("counters.url is required for the redis counter backend"))?;

        info!("Connecting to Redis counter store (response_timeout={:?})", config.response_timeout);

        let client = redis::Client::open(url)?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(config.response_timeout.max(Duration::from_secs(1)))
            .set_response_timeout(config.response_timeout)
            .set_number_of_retries(2);

        let manager = Self::connect_with_retry(&client, manager_config).await?;
        info!("Connected to Redis counter store");

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
            incr_script: redis::Script::new(INCR_WITH_TTL),
            record_event_script: redis::Script::new(RECORD_EVENT),
            count_events_script: redis::Script::new(COUNT_EVENTS),
        })
    }

    /// Connect with exponential backoff
    async fn connect_with_retry(client: &redis::Client, config: ConnectionManagerConfig) -> anyhow::Result<ConnectionManager> {
        let mut delay = INITIAL_RETRY_DELAY;
        let mut attempt = 0;
        loop {
            match ConnectionManager::new_with_config(client.clone(), config.clone()).await {
                Ok(manager) => {
                    if attempt > 0 {
                        info!("Redis connection established after {} retries", attempt);
                    }
                    return Ok(manager);
                }
                Err(e) if attempt < CONNECT_RETRIES => {
                    attempt += 1;
                    warn!(
                        "Redis connection attempt {}/{} failed, retrying in {:?}: {}",
                        attempt,
                        CONNECT_RETRIES + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_RETRY_DELAY);
                }
                Err(e) => {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to Redis after {} attempts: {e}",
                        CONNECT_RETRIES + 1
                    ));
                }
            }
        }
    }

    fn build_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

/// Clamp a duration to whole milliseconds, at least one
fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    #[instrument(skip(self), err)]
    async fn incr(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let value: i64 = self
            .incr_script
            .key(self.build_key(key))
            .arg(delta)
            .arg(millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.manager.clone();
        let value: Option<i64> = conn.get(self.build_key(key)).await?;
        Ok(value)
    }

    #[instrument(skip(self), err)]
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.pset_ex::<_, _, ()>(self.build_key(key), value, millis(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(self.build_key(key)).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        let mut conn = self.manager.clone();
        let pttl: i64 = conn.pttl(self.build_key(key)).await?;
        // -2: no such key, -1: no expiry
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(CounterError::Protocol(format!("PING returned {reply}")))
        }
    }

    #[instrument(skip(self), err)]
    async fn record_event(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = self
            .record_event_script
            .key(self.build_key(key))
            .arg(millis(window))
            .arg(uuid::Uuid::new_v4().to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn count_events(&self, key: &str, window: Duration) -> Result<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = self
            .count_events_script
            .key(self.build_key(key))
            .arg(millis(window))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }
}

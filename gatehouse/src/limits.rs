//! Request rate limiting per client and endpoint class.
//!
//! Counting uses a sliding window over two fixed windows held in the shared counter store:
//! the current window's count plus the previous window's count weighted by how much of it
//! still overlaps the sliding window. Every replica increments the same keys, so the budget is
//! global rather than per process.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::counters::CounterStore;
use crate::errors::{Error, Result};
use crate::types::EndpointClass;

pub const LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Outcome of an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub class: EndpointClass,
    /// Accepted requests per window, burst included. `None` for unmetered requests.
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
}

impl RateLimitDecision {
    fn unmetered(class: EndpointClass) -> Self {
        Self {
            class,
            limit: None,
            remaining: None,
        }
    }

    /// Add `X-RateLimit-*` headers for metered requests.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if let (Some(limit), Some(remaining)) = (self.limit, self.remaining) {
            headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
            headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
        }
    }
}

/// Shared sliding-window rate limiter.
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(counters: Arc<dyn CounterStore>, config: RateLimitConfig) -> Self {
        Self { counters, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn window_millis(&self) -> i64 {
        i64::try_from(self.config.window.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    /// Admit or reject one request from `client_key` against `class`'s budget.
    ///
    /// Returns `RateLimited` with the time until the current window closes when over budget.
    /// When the counter store is unreachable the request is admitted if `fail_open` is set,
    /// otherwise `StoreUnavailable` is returned.
    pub async fn allow(&self, client_key: &str, class: EndpointClass) -> Result<RateLimitDecision> {
        self.allow_at(client_key, class, Utc::now().timestamp_millis()).await
    }

    pub(crate) async fn allow_at(&self, client_key: &str, class: EndpointClass, now_ms: i64) -> Result<RateLimitDecision> {
        let limit = self.config.limit_for(class);
        if !self.config.enabled || limit.exempt {
            return Ok(RateLimitDecision::unmetered(class));
        }

        match self.count(client_key, class, limit.ceiling(self.config.window), now_ms).await {
            Ok(decision) => decision,
            Err(e) if self.config.fail_open => {
                warn!(error = %e, %class, "Rate limit store unavailable, admitting request");
                Ok(RateLimitDecision::unmetered(class))
            }
            Err(e) => {
                warn!(error = %e, %class, "Rate limit store unavailable, rejecting request");
                Err(e.into())
            }
        }
    }

    async fn count(
        &self,
        client_key: &str,
        class: EndpointClass,
        ceiling: u64,
        now_ms: i64,
    ) -> std::result::Result<Result<RateLimitDecision>, crate::counters::CounterError> {
        let window_ms = self.window_millis();
        let index = now_ms.div_euclid(window_ms);
        let elapsed_ms = now_ms.rem_euclid(window_ms);

        let current_key = format!("rl:{class}:{client_key}:{index}");
        let previous_key = format!("rl:{class}:{client_key}:{}", index - 1);
        // Keys outlive their window so the next window can still weigh them
        let ttl = self.config.window.saturating_mul(2);

        let current = self.counters.incr(&current_key, 1, ttl).await?;
        let previous = self.counters.get(&previous_key).await?.unwrap_or(0);

        let overlap = 1.0 - (elapsed_ms as f64 / window_ms as f64);
        let weighted_previous = (previous.max(0) as f64 * overlap).floor() as u64;
        let estimate = (current.max(0) as u64).saturating_add(weighted_previous);

        if estimate <= ceiling {
            return Ok(Ok(RateLimitDecision {
                class,
                limit: Some(ceiling),
                remaining: Some(ceiling - estimate),
            }));
        }

        // Give back the slot so rejected requests never consume budget
        self.counters.incr(&current_key, -1, ttl).await?;

        let retry_after = Duration::from_millis((window_ms - elapsed_ms) as u64).max(Duration::from_secs(1));
        debug!(%class, estimate, ceiling, ?retry_after, "Request rate limited");
        Ok(Err(Error::RateLimited { retry_after }))
    }
}

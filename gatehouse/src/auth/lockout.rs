//! Brute-force protection keyed on username and client address.
//!
//! Failures are logged in the shared counter store so every replica sees the same tally, and
//! counted over the trailing window rather than a fixed bucket. Once the count reaches the
//! threshold a lock marker is written whose TTL is the lockout duration;
//! while it exists every attempt for that identity is refused, whatever the credentials.

use chrono::Utc;
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;

use crate::{
    config::LockoutConfig,
    counters::CounterStore,
    db::{
        models::login_attempts::{AttemptOutcome, LoginAttemptCreateDBRequest},
        store::CredentialStore,
    },
    errors::{Error, Result},
    types::{IdentityKey, UserId},
};

/// Derived lockout state of an identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LockoutStatus {
    Clear,
    Warning {
        failures: u32,
        /// Failures left before the identity locks
        remaining: u32,
    },
    Locked {
        #[serde(with = "humantime_serde")]
        #[schema(value_type = String)]
        retry_after: Duration,
    },
}

pub struct LockoutGuard {
    counters: Arc<dyn CounterStore>,
    store: Arc<dyn CredentialStore>,
    config: LockoutConfig,
}

fn failure_key(identity: &IdentityKey) -> String {
    format!("lockout:fail:{identity}")
}

fn lock_key(identity: &IdentityKey) -> String {
    format!("lockout:lock:{identity}")
}

fn store_unavailable(operation: &str) -> impl FnOnce(crate::counters::CounterError) -> Error + '_ {
    move |e| {
        warn!(error = %e, "Lockout store unavailable during {operation}");
        Error::StoreUnavailable {
            operation: format!("{operation}: {e}"),
        }
    }
}

impl LockoutGuard {
    pub fn new(counters: Arc<dyn CounterStore>, store: Arc<dyn CredentialStore>, config: LockoutConfig) -> Self {
        Self { counters, store, config }
    }

    pub fn config(&self) -> &LockoutConfig {
        &self.config
    }

    /// Remaining lock time, if the identity is locked.
    async fn locked_for(&self, identity: &IdentityKey) -> Result<Option<Duration>> {
        let key = lock_key(identity);
        let Some(locked_until_ms) = self.counters.get(&key).await.map_err(store_unavailable("lock lookup"))? else {
            return Ok(None);
        };

        let remaining = match self.counters.ttl(&key).await.map_err(store_unavailable("lock lookup"))? {
            Some(ttl) => ttl,
            // Marker without expiry: fall back to the timestamp it carries
            None => {
                let millis = locked_until_ms.saturating_sub(Utc::now().timestamp_millis());
                Duration::from_millis(millis.max(0) as u64)
            }
        };

        if remaining.is_zero() {
            return Ok(None);
        }
        Ok(Some(remaining))
    }

    /// Refuse attempts for a locked identity. Called before any password verification; a
    /// store outage refuses the attempt.
    #[instrument(skip(self), fields(identity = %identity), err)]
    pub async fn check_allowed(&self, identity: &IdentityKey) -> Result<()> {
        match self.locked_for(identity).await? {
            Some(retry_after) => {
                debug!(?retry_after, "Attempt refused for locked identity");
                Err(Error::Locked { retry_after })
            }
            None => Ok(()),
        }
    }

    /// Record the result of a credential check and update the counters.
    #[instrument(skip(self), fields(identity = %identity), err)]
    pub async fn record_attempt(
        &self,
        identity: &IdentityKey,
        user_id: Option<UserId>,
        outcome: AttemptOutcome,
    ) -> Result<LockoutStatus> {
        let status = match outcome {
            AttemptOutcome::Success => {
                self.counters
                    .delete(&failure_key(identity))
                    .await
                    .map_err(store_unavailable("failure counter reset"))?;
                LockoutStatus::Clear
            }
            AttemptOutcome::Failure => {
                let failures = self
                    .counters
                    .record_event(&failure_key(identity), self.config.window)
                    .await
                    .map_err(store_unavailable("failure counter increment"))?;
                let failures = u32::try_from(failures).unwrap_or(u32::MAX);

                if failures >= self.config.threshold {
                    self.lock(identity).await?;
                    warn!(
                        security_event = "identity_locked",
                        failures,
                        duration = ?self.config.duration,
                        "Identity locked after repeated login failures"
                    );
                    LockoutStatus::Locked {
                        retry_after: self.config.duration,
                    }
                } else {
                    LockoutStatus::Warning {
                        failures,
                        remaining: self.config.threshold - failures,
                    }
                }
            }
        };

        // The attempt log is an audit trail; losing a row must not change the login outcome
        let attempt = LoginAttemptCreateDBRequest {
            identity_key: identity.as_str().to_string(),
            user_id,
            outcome,
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.store.record_login_attempt(&attempt).await {
            warn!(error = %e, "Failed to record login attempt");
        }

        Ok(status)
    }

    async fn lock(&self, identity: &IdentityKey) -> Result<()> {
        let duration = chrono::Duration::from_std(self.config.duration).unwrap_or(chrono::Duration::MAX);
        let locked_until = (Utc::now() + duration).timestamp_millis();
        self.counters
            .set(&lock_key(identity), locked_until, self.config.duration)
            .await
            .map_err(store_unavailable("lock write"))?;
        // Failures after the lock expires start from zero
        self.counters
            .delete(&failure_key(identity))
            .await
            .map_err(store_unavailable("failure counter reset"))?;
        Ok(())
    }

    /// Current state of an identity
    pub async fn status(&self, identity: &IdentityKey) -> Result<LockoutStatus> {
        if let Some(retry_after) = self.locked_for(identity).await? {
            return Ok(LockoutStatus::Locked { retry_after });
        }

        let failures = self
            .counters
            .count_events(&failure_key(identity), self.config.window)
            .await
            .map_err(store_unavailable("failure counter lookup"))?;
        let failures = u32::try_from(failures).unwrap_or(u32::MAX);

        if failures == 0 {
            Ok(LockoutStatus::Clear)
        } else {
            Ok(LockoutStatus::Warning {
                failures,
                remaining: self.config.threshold.saturating_sub(failures),
            })
        }
    }

    /// Administrative reset: clears both the lock and the failure count.
    #[instrument(skip(self), fields(identity = %identity), err)]
    pub async fn unlock(&self, identity: &IdentityKey) -> Result<()> {
        self.counters
            .delete(&lock_key(identity))
            .await
            .map_err(store_unavailable("unlock"))?;
        self.counters
            .delete(&failure_key(identity))
            .await
            .map_err(store_unavailable("unlock"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::MemoryCounterStore;
    use crate::db::memory::MemoryCredentialStore;
    use crate::test_utils::FailingCounterStore;

    fn config() -> LockoutConfig {
        LockoutConfig {
            threshold: 3,
            window: Duration::from_secs(60),
            duration: Duration::from_secs(300),
            ..Default::default()
        }
    }

    fn guard() -> (LockoutGuard, Arc<MemoryCredentialStore>) {
        let store = Arc::new(MemoryCredentialStore::new());
        (
            LockoutGuard::new(Arc::new(MemoryCounterStore::new()), store.clone(), config()),
            store,
        )
    }

    #[tokio::test]
    async fn test_clear_to_warning_to_locked() {
        let (guard, _) = guard();
        let identity = IdentityKey::new("alice", "10.0.0.1");

        assert_eq!(guard.status(&identity).await.unwrap(), LockoutStatus::Clear);

        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert_eq!(status, LockoutStatus::Warning { failures: 1, remaining: 2 });
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert!(guard.check_allowed(&identity).await.is_ok());

        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert!(matches!(status, LockoutStatus::Locked { .. }));

        match guard.check_allowed(&identity).await {
            Err(Error::Locked { retry_after }) => {
                assert!(retry_after <= Duration::from_secs(300));
                assert!(retry_after > Duration::from_secs(290));
            }
            other => panic!("expected Locked, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let (guard, _) = guard();
        let identity = IdentityKey::new("bob", "10.0.0.2");
        for _ in 0..3 {
            guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        }
        assert!(guard.check_allowed(&identity).await.is_err());

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(guard.check_allowed(&identity).await.is_ok());
        assert_eq!(guard.status(&identity).await.unwrap(), LockoutStatus::Clear);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_counted_over_trailing_window() {
        let (guard, _) = guard();
        let identity = IdentityKey::new("heidi", "10.0.0.8");

        // Failures at t=0, 50, 61, 62 with a 60s window: (2s, 62s] holds three of them
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        tokio::time::advance(Duration::from_secs(50)).await;
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert_eq!(status, LockoutStatus::Warning { failures: 2, remaining: 1 });
        tokio::time::advance(Duration::from_secs(1)).await;
        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();

        assert!(matches!(status, LockoutStatus::Locked { .. }));
        assert!(matches!(guard.check_allowed(&identity).await, Err(Error::Locked { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_old_failures_age_out() {
        let (guard, _) = guard();
        let identity = IdentityKey::new("ivan", "10.0.0.9");
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(guard.status(&identity).await.unwrap(), LockoutStatus::Clear);
        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert_eq!(status, LockoutStatus::Warning { failures: 1, remaining: 2 });
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let (guard, store) = guard();
        let identity = IdentityKey::new("carol", "10.0.0.3");
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        guard.record_attempt(&identity, None, AttemptOutcome::Success).await.unwrap();

        assert_eq!(guard.status(&identity).await.unwrap(), LockoutStatus::Clear);

        let attempts = store.recent_login_attempts(identity.as_str(), 10).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(
            attempts.iter().filter(|a| a.outcome == AttemptOutcome::Failure).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let (guard, _) = guard();
        let attacker = IdentityKey::new("dave", "192.0.2.1");
        let owner = IdentityKey::new("dave", "198.51.100.7");
        for _ in 0..3 {
            guard.record_attempt(&attacker, None, AttemptOutcome::Failure).await.unwrap();
        }
        assert!(guard.check_allowed(&attacker).await.is_err());
        assert!(guard.check_allowed(&owner).await.is_ok());
    }

    #[tokio::test]
    async fn test_unlock() {
        let (guard, _) = guard();
        let identity = IdentityKey::new("erin", "10.0.0.5");
        for _ in 0..3 {
            guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        }
        guard.unlock(&identity).await.unwrap();
        assert!(guard.check_allowed(&identity).await.is_ok());
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let guard = LockoutGuard::new(
            Arc::new(FailingCounterStore),
            Arc::new(MemoryCredentialStore::new()),
            config(),
        );
        let identity = IdentityKey::new("frank", "10.0.0.6");
        assert!(matches!(
            guard.check_allowed(&identity).await,
            Err(Error::StoreUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_attempt_log_outage_does_not_block() {
        let (guard, store) = guard();
        store.set_unavailable(true);
        let identity = IdentityKey::new("grace", "10.0.0.7");
        let status = guard.record_attempt(&identity, None, AttemptOutcome::Failure).await.unwrap();
        assert!(matches!(status, LockoutStatus::Warning { failures: 1, .. }));
    }
}

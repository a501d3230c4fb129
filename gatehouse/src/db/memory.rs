//! In-process credential store.
//!
//! All state sits behind one mutex, which gives rotation the same all-or-nothing behaviour the
//! Postgres transaction provides. No await point is ever reached while the lock is held.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::{
    db::{
        errors::{DbError, Result, TOKEN_HASH_KEY, TOKEN_OWNER_FKEY},
        models::{
            login_attempts::{LoginAttemptCreateDBRequest, LoginAttemptDBResponse},
            refresh_tokens::{RefreshTokenCreateDBRequest, RefreshTokenDBResponse, RevocationReason, RotationOutcome},
            users::{UserCreateDBRequest, UserDBResponse},
        },
        store::CredentialStore,
    },
    types::{RefreshTokenId, Role, UserId},
};

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, UserDBResponse>,
    tokens: HashMap<RefreshTokenId, RefreshTokenDBResponse>,
    attempts: Vec<LoginAttemptDBResponse>,
}

#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: Mutex<Inner>,
    unavailable: AtomicBool,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the database were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory store switched off".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| DbError::Other(anyhow::anyhow!("memory credential store mutex poisoned")))
    }

    fn find_user_mut(inner: &mut Inner, id: UserId) -> Result<&mut UserDBResponse> {
        inner.users.get_mut(&id).ok_or(DbError::NotFound)
    }
}

fn revoke_row(token: &mut RefreshTokenDBResponse, reason: RevocationReason, at: DateTime<Utc>) -> bool {
    if token.revoked {
        return false;
    }
    token.revoked = true;
    token.revoked_at = Some(at);
    token.revocation_reason = Some(reason);
    true
}

fn new_row(request: &RefreshTokenCreateDBRequest) -> RefreshTokenDBResponse {
    RefreshTokenDBResponse {
        id: request.id,
        user_id: request.user_id,
        token_hash: request.token_hash.clone(),
        issued_at: request.issued_at,
        expires_at: request.expires_at,
        revoked: false,
        revoked_at: None,
        revocation_reason: None,
        replaced_by: None,
        device_fingerprint: request.device_fingerprint.clone(),
    }
}

fn check_insertable(inner: &Inner, request: &RefreshTokenCreateDBRequest) -> Result<()> {
    if !inner.users.contains_key(&request.user_id) {
        return Err(DbError::InvalidReference {
            constraint: TOKEN_OWNER_FKEY.to_string(),
        });
    }
    if inner.tokens.contains_key(&request.id) || inner.tokens.values().any(|t| t.token_hash == request.token_hash) {
        return Err(DbError::Conflict {
            constraint: TOKEN_HASH_KEY.to_string(),
            value: None,
        });
    }
    Ok(())
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<UserDBResponse> {
        let mut inner = self.lock()?;
        let username = request.username.trim();
        let folded = username.to_lowercase();
        if inner.users.values().any(|u| u.username.to_lowercase() == folded) {
            return Err(DbError::duplicate_username(username));
        }

        let now = Utc::now();
        let user = UserDBResponse {
            id: Uuid::new_v4(),
            username: username.to_string(),
            password_hash: request.password_hash.clone(),
            role: request.role,
            is_active: true,
            last_login: None,
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserDBResponse>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserDBResponse>> {
        let folded = username.trim().to_lowercase();
        Ok(self
            .lock()?
            .users
            .values()
            .find(|u| u.username.to_lowercase() == folded)
            .cloned())
    }

    async fn record_login(&self, id: UserId, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock()?;
        Self::find_user_mut(&mut inner, id)?.last_login = Some(at);
        Ok(())
    }

    async fn set_user_active(&self, id: UserId, is_active: bool) -> Result<UserDBResponse> {
        let mut inner = self.lock()?;
        let user = Self::find_user_mut(&mut inner, id)?;
        user.is_active = is_active;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_user_role(&self, id: UserId, role: Role) -> Result<UserDBResponse> {
        let mut inner = self.lock()?;
        let user = Self::find_user_mut(&mut inner, id)?;
        user.role = role;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn insert_refresh_token(&self, request: &RefreshTokenCreateDBRequest) -> Result<RefreshTokenDBResponse> {
        let mut inner = self.lock()?;
        check_insertable(&inner, request)?;
        let row = new_row(request);
        inner.tokens.insert(row.id, row.clone());
        Ok(row)
    }

    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenDBResponse>> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn rotate_refresh_token(&self, old_id: RefreshTokenId, successor: &RefreshTokenCreateDBRequest) -> Result<RotationOutcome> {
        let mut inner = self.lock()?;
        check_insertable(&inner, successor)?;

        let old = inner.tokens.get_mut(&old_id).ok_or(DbError::NotFound)?;
        if !revoke_row(old, RevocationReason::Rotated, successor.issued_at) {
            return Ok(RotationOutcome::AlreadyRevoked);
        }
        old.replaced_by = Some(successor.id);

        let row = new_row(successor);
        inner.tokens.insert(row.id, row.clone());
        Ok(RotationOutcome::Rotated(row))
    }

    async fn revoke_refresh_token(&self, id: RefreshTokenId, reason: RevocationReason, at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.lock()?;
        Ok(inner.tokens.get_mut(&id).is_some_and(|token| revoke_row(token, reason, at)))
    }

    async fn revoke_all_for_user(&self, user_id: UserId, reason: RevocationReason, at: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let revoked = inner
            .tokens
            .values_mut()
            .filter(|token| token.user_id == user_id)
            .map(|token| revoke_row(token, reason, at))
            .filter(|revoked| *revoked)
            .count();
        Ok(revoked as u64)
    }

    async fn list_active_refresh_tokens(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<RefreshTokenDBResponse>> {
        let inner = self.lock()?;
        let mut tokens: Vec<_> = inner
            .tokens
            .values()
            .filter(|t| t.user_id == user_id && !t.revoked && !t.is_expired_at(now))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(tokens)
    }

    async fn purge_expired_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let before_len = inner.tokens.len();
        inner.tokens.retain(|_, t| t.expires_at >= before);
        Ok((before_len - inner.tokens.len()) as u64)
    }

    async fn record_login_attempt(&self, request: &LoginAttemptCreateDBRequest) -> Result<LoginAttemptDBResponse> {
        let mut inner = self.lock()?;
        let attempt = LoginAttemptDBResponse {
            id: Uuid::new_v4(),
            identity_key: request.identity_key.clone(),
            user_id: request.user_id,
            outcome: request.outcome,
            attempted_at: request.attempted_at,
        };
        inner.attempts.push(attempt.clone());
        Ok(attempt)
    }

    async fn recent_login_attempts(&self, identity_key: &str, limit: i64) -> Result<Vec<LoginAttemptDBResponse>> {
        let inner = self.lock()?;
        let mut attempts: Vec<_> = inner
            .attempts
            .iter()
            .filter(|a| a.identity_key == identity_key)
            .cloned()
            .collect();
        attempts.sort_by(|a, b| b.attempted_at.cmp(&a.attempted_at));
        attempts.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(attempts)
    }

    async fn purge_login_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let before_len = inner.attempts.len();
        inner.attempts.retain(|a| a.attempted_at >= before);
        Ok((before_len - inner.attempts.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::login_attempts::AttemptOutcome;
    use chrono::Duration;
    use std::sync::Arc;

    async fn seeded() -> (MemoryCredentialStore, UserDBResponse) {
        let store = MemoryCredentialStore::new();
        let user = store
            .create_user(&UserCreateDBRequest {
                username: "Alice".to_string(),
                password_hash: "hash".to_string(),
                role: Role::User,
            })
            .await
            .unwrap();
        (store, user)
    }

    fn token(user_id: UserId, hash: &str) -> RefreshTokenCreateDBRequest {
        let now = Utc::now();
        RefreshTokenCreateDBRequest {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash.to_string(),
            issued_at: now,
            expires_at: now + Duration::hours(1),
            device_fingerprint: None,
        }
    }

    #[tokio::test]
    async fn test_username_uniqueness_ignores_case() {
        let (store, _) = seeded().await;
        let err = store
            .create_user(&UserCreateDBRequest {
                username: "ALICE".to_string(),
                password_hash: "hash".to_string(),
                role: Role::User,
            })
            .await
            .unwrap_err();
        assert!(err.is_duplicate_username());
        assert!(store.get_user_by_username("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rotation_links_successor() {
        let (store, user) = seeded().await;
        let original = store.insert_refresh_token(&token(user.id, "h0")).await.unwrap();
        let next = token(user.id, "h1");
        let outcome = store.rotate_refresh_token(original.id, &next).await.unwrap();
        assert!(matches!(outcome, RotationOutcome::Rotated(ref row) if row.id == next.id));

        let old = store.find_refresh_token_by_hash("h0").await.unwrap().unwrap();
        assert!(old.revoked);
        assert_eq!(old.replaced_by, Some(next.id));
        assert_eq!(old.revocation_reason, Some(RevocationReason::Rotated));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rotation_has_one_winner() {
        let (store, user) = seeded().await;
        let store = Arc::new(store);
        let original = store.insert_refresh_token(&token(user.id, "h0")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let request = token(user.id, &format!("succ-{i}"));
            handles.push(tokio::spawn(async move {
                store.rotate_refresh_token(original.id, &request).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), RotationOutcome::Rotated(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.list_active_refresh_tokens(user.id, Utc::now()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_requires_existing_user() {
        let store = MemoryCredentialStore::new();
        let err = store.insert_refresh_token(&token(Uuid::new_v4(), "h")).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidReference { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_switch() {
        let (store, user) = seeded().await;
        store.set_unavailable(true);
        assert!(matches!(store.get_user_by_id(user.id).await, Err(DbError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.get_user_by_id(user.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_attempt_log_and_purge() {
        let (store, user) = seeded().await;
        for days_ago in [1, 10, 40] {
            store
                .record_login_attempt(&LoginAttemptCreateDBRequest {
                    identity_key: "alice@1.2.3.4".to_string(),
                    user_id: Some(user.id),
                    outcome: AttemptOutcome::Failure,
                    attempted_at: Utc::now() - Duration::days(days_ago),
                })
                .await
                .unwrap();
        }
        let recent = store.recent_login_attempts("alice@1.2.3.4", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].attempted_at > recent[1].attempted_at);

        assert_eq!(store.purge_login_attempts(Utc::now() - Duration::days(30)).await.unwrap(), 1);
    }
}

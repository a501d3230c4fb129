//! The credential store seam.
//!
//! Services never touch SQL directly: they hold an `Arc<dyn CredentialStore>`. The Postgres
//! implementation delegates to the repositories in [`crate::db::handlers`]; the in-memory
//! implementation in [`crate::db::memory`] backs tests and single-node development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;

use crate::{
    config::DatabaseConfig,
    db::{
        errors::Result,
        handlers::{LoginAttempts, RefreshTokens, Users},
        models::{
            login_attempts::{LoginAttemptCreateDBRequest, LoginAttemptDBResponse},
            refresh_tokens::{RefreshTokenCreateDBRequest, RefreshTokenDBResponse, RevocationReason, RotationOutcome},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    types::{RefreshTokenId, Role, UserId},
};

#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    // Users
    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<UserDBResponse>;
    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserDBResponse>>;
    /// Case-insensitive
    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserDBResponse>>;
    async fn record_login(&self, id: UserId, at: DateTime<Utc>) -> Result<()>;
    async fn set_user_active(&self, id: UserId, is_active: bool) -> Result<UserDBResponse>;
    async fn set_user_role(&self, id: UserId, role: Role) -> Result<UserDBResponse>;

    // Refresh tokens
    async fn insert_refresh_token(&self, request: &RefreshTokenCreateDBRequest) -> Result<RefreshTokenDBResponse>;
    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenDBResponse>>;
    /// Atomically revoke `old_id` (only if still live) and insert `successor`.
    async fn rotate_refresh_token(&self, old_id: RefreshTokenId, successor: &RefreshTokenCreateDBRequest) -> Result<RotationOutcome>;
    async fn revoke_refresh_token(&self, id: RefreshTokenId, reason: RevocationReason, at: DateTime<Utc>) -> Result<bool>;
    async fn revoke_all_for_user(&self, user_id: UserId, reason: RevocationReason, at: DateTime<Utc>) -> Result<u64>;
    async fn list_active_refresh_tokens(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<RefreshTokenDBResponse>>;
    async fn purge_expired_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64>;

    // Login attempts
    async fn record_login_attempt(&self, request: &LoginAttemptCreateDBRequest) -> Result<LoginAttemptDBResponse>;
    async fn recent_login_attempts(&self, identity_key: &str, limit: i64) -> Result<Vec<LoginAttemptDBResponse>>;
    async fn purge_login_attempts(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Round trip to the backing store
    async fn ping(&self) -> Result<()>;
}

/// PostgreSQL-backed credential store.
#[derive(Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool using the configured settings
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let options = sqlx::postgres::PgConnectOptions::from_str(&config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.store_pool.max_connections)
            .min_connections(config.store_pool.min_connections)
            .acquire_timeout(config.store_pool.acquire_timeout)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn create_user(&self, request: &UserCreateDBRequest) -> Result<UserDBResponse> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).create(request).await
    }

    async fn get_user_by_id(&self, id: UserId) -> Result<Option<UserDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).get_by_id(id).await
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<UserDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).get_by_username(username).await
    }

    async fn record_login(&self, id: UserId, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).record_login(id, at).await
    }

    async fn set_user_active(&self, id: UserId, is_active: bool) -> Result<UserDBResponse> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).set_active(id, is_active).await
    }

    async fn set_user_role(&self, id: UserId, role: Role) -> Result<UserDBResponse> {
        let mut conn = self.pool.acquire().await?;
        Users::new(&mut conn).set_role(id, role).await
    }

    async fn insert_refresh_token(&self, request: &RefreshTokenCreateDBRequest) -> Result<RefreshTokenDBResponse> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).create(request).await
    }

    async fn find_refresh_token_by_hash(&self, token_hash: &str) -> Result<Option<RefreshTokenDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).get_by_hash(token_hash).await
    }

    async fn rotate_refresh_token(&self, old_id: RefreshTokenId, successor: &RefreshTokenCreateDBRequest) -> Result<RotationOutcome> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).rotate(old_id, successor).await
    }

    async fn revoke_refresh_token(&self, id: RefreshTokenId, reason: RevocationReason, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).revoke(id, reason, at).await
    }

    async fn revoke_all_for_user(&self, user_id: UserId, reason: RevocationReason, at: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).revoke_all_for_user(user_id, reason, at).await
    }

    async fn list_active_refresh_tokens(&self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<RefreshTokenDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).list_active_for_user(user_id, now).await
    }

    async fn purge_expired_refresh_tokens(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        RefreshTokens::new(&mut conn).purge_expired(before).await
    }

    async fn record_login_attempt(&self, request: &LoginAttemptCreateDBRequest) -> Result<LoginAttemptDBResponse> {
        let mut conn = self.pool.acquire().await?;
        LoginAttempts::new(&mut conn).create(request).await
    }

    async fn recent_login_attempts(&self, identity_key: &str, limit: i64) -> Result<Vec<LoginAttemptDBResponse>> {
        let mut conn = self.pool.acquire().await?;
        LoginAttempts::new(&mut conn).list_for_identity(identity_key, limit).await
    }

    async fn purge_login_attempts(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        LoginAttempts::new(&mut conn).purge_older_than(before).await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::login_attempts::AttemptOutcome;
    use crate::db::errors::DbError;
    use chrono::Duration;
    use uuid::Uuid;

    fn user_request(username: &str) -> UserCreateDBRequest {
        UserCreateDBRequest {
            username: username.to_string(),
            password_hash: "$argon2id$v=19$m=19456,t=2,p=1$c2FsdA$aGFzaA".to_string(),
            role: Role::User,
        }
    }

    fn token_request(user_id: UserId, hash: &str) -> RefreshTokenCreateDBRequest {
        let now = Utc::now();
        RefreshTokenCreateDBRequest {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash.to_string(),
            issued_at: now,
            expires_at: now + Duration::days(1),
            device_fingerprint: Some("test-agent".to_string()),
        }
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_usernames_unique_case_insensitively(pool: PgPool) {
        let store = PgCredentialStore::new(pool);
        store.create_user(&user_request("Alice")).await.unwrap();
        let err = store.create_user(&user_request("alice")).await.unwrap_err();
        assert!(err.is_duplicate_username());

        let found = store.get_user_by_username("ALICE").await.unwrap().unwrap();
        assert_eq!(found.username, "Alice");
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_rotation_is_compare_and_swap(pool: PgPool) {
        let store = PgCredentialStore::new(pool);
        let user = store.create_user(&user_request("bob")).await.unwrap();
        let original = store.insert_refresh_token(&token_request(user.id, "h0")).await.unwrap();

        let first = store.rotate_refresh_token(original.id, &token_request(user.id, "h1")).await.unwrap();
        let RotationOutcome::Rotated(successor) = first else {
            panic!("first rotation should succeed");
        };

        let second = store.rotate_refresh_token(original.id, &token_request(user.id, "h2")).await.unwrap();
        assert!(matches!(second, RotationOutcome::AlreadyRevoked));
        // The losing successor was never written
        assert!(store.find_refresh_token_by_hash("h2").await.unwrap().is_none());

        let old = store.find_refresh_token_by_hash("h0").await.unwrap().unwrap();
        assert!(old.revoked);
        assert_eq!(old.revocation_reason, Some(RevocationReason::Rotated));
        assert_eq!(old.replaced_by, Some(successor.id));
    }

    #[sqlx::test]
    #[ignore = "requires DATABASE_URL"]
    async fn test_revoke_all_and_purge(pool: PgPool) {
        let store = PgCredentialStore::new(pool);
        let user = store.create_user(&user_request("carol")).await.unwrap();
        store.insert_refresh_token(&token_request(user.id, "a")).await.unwrap();
        store.insert_refresh_token(&token_request(user.id, "b")).await.unwrap();

        assert_eq!(store.list_active_refresh_tokens(user.id, Utc::now()).await.unwrap().len(), 2);
        let revoked = store
            .revoke_all_for_user(user.id, RevocationReason::LogoutAll, Utc::now())
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert!(store.list_active_refresh_tokens(user.id, Utc::now()).await.unwrap().is_empty());

        store
            .record_login_attempt(&LoginAttemptCreateDBRequest {
                identity_key: "carol@127.0.0.1".to_string(),
                user_id: Some(user.id),
                outcome: AttemptOutcome::Failure,
                attempted_at: Utc::now() - Duration::days(40),
            })
            .await
            .unwrap();
        assert_eq!(store.purge_login_attempts(Utc::now() - Duration::days(30)).await.unwrap(), 1);
    }
}

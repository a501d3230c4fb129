//! The single entry contract business handlers depend on.
//!
//! [`AuthGateway`] composes rate limiting, lockout, password verification, token issuance and
//! connection leasing. A request either yields an [`AuthenticatedContext`] (verified claims plus
//! a leased connection) or one of the typed failures in [`crate::errors::Error`].

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::{
    auth::{
        lockout::LockoutGuard,
        password::{Argon2Params, dummy_hash, hash_password, validate_password, verify_password},
        tokens::{Claims, TokenPair, TokenService},
    },
    config::{Config, PasswordConfig},
    counters::CounterStore,
    db::{
        models::{
            login_attempts::AttemptOutcome,
            refresh_tokens::RevocationReason,
            users::{UserCreateDBRequest, UserDBResponse},
        },
        pools::{ConnectionPoolManager, Connector, PgConnector, PooledConnection},
        store::CredentialStore,
    },
    errors::{Error, Result},
    limits::{RateLimitDecision, RateLimiter},
    types::{EndpointClass, IdentityKey, Role, UserId, abbrev_uuid},
};

const USERNAME_MAX_LENGTH: usize = 64;

/// A verified caller together with the connection its handler runs on.
///
/// Dropping the context returns the connection to the pool.
pub struct AuthenticatedContext<C: Connector = PgConnector> {
    pub claims: Claims,
    pub connection: PooledConnection<C>,
}

impl<C: Connector> AuthenticatedContext<C> {
    pub fn user_id(&self) -> UserId {
        self.claims.sub
    }

    pub fn role(&self) -> Role {
        self.claims.role
    }

    /// Fail with `Forbidden` unless the caller is an administrator.
    pub fn require_admin(&self) -> Result<()> {
        if self.claims.role.is_admin() {
            Ok(())
        } else {
            Err(Error::Forbidden {
                message: "Administrator role required".to_string(),
            })
        }
    }
}

/// Transport-independent description of an inbound request
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub client_addr: String,
    pub class: EndpointClass,
    /// Raw `Authorization` header value, if any
    pub authorization: Option<String>,
}

/// Extract the token from an `Authorization: Bearer <token>` value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

pub struct AuthGateway<C: Connector = PgConnector> {
    store: Arc<dyn CredentialStore>,
    tokens: TokenService,
    lockout: LockoutGuard,
    limiter: RateLimiter,
    pool: ConnectionPoolManager<C>,
    password_config: PasswordConfig,
    argon2: Argon2Params,
    dummy_hash: String,
    allow_registration: bool,
}

impl<C: Connector> AuthGateway<C> {
    pub fn new(
        config: &Config,
        store: Arc<dyn CredentialStore>,
        counters: Arc<dyn CounterStore>,
        pool: ConnectionPoolManager<C>,
    ) -> Result<Self> {
        let argon2 = Argon2Params::from(&config.auth.password);
        Ok(Self {
            tokens: TokenService::new(config, store.clone())?,
            lockout: LockoutGuard::new(counters.clone(), store.clone(), config.auth.lockout.clone()),
            limiter: RateLimiter::new(counters, config.rate_limits.clone()),
            store,
            pool,
            password_config: config.auth.password.clone(),
            argon2,
            dummy_hash: dummy_hash(argon2)?,
            allow_registration: config.auth.allow_registration,
        })
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn lockout(&self) -> &LockoutGuard {
        &self.lockout
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn pool(&self) -> &ConnectionPoolManager<C> {
        &self.pool
    }

    /// Charge one request against `client_key`'s budget for `class`.
    pub async fn admit(&self, client_key: &str, class: EndpointClass) -> Result<RateLimitDecision> {
        self.limiter.allow(client_key, class).await
    }

    async fn hash(&self, password: &str) -> Result<String> {
        let password = password.to_string();
        let params = self.argon2;
        tokio::task::spawn_blocking(move || hash_password(&password, params))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("join password hashing task: {e}"),
            })?
    }

    async fn verify(&self, password: &str, hash: String) -> Result<bool> {
        let password = password.to_string();
        tokio::task::spawn_blocking(move || verify_password(&password, &hash))
            .await
            .map_err(|e| Error::Internal {
                operation: format!("join password verification task: {e}"),
            })?
    }

    fn validate_username(username: &str) -> Result<&str> {
        let username = username.trim();
        if username.is_empty() {
            return Err(Error::Validation {
                message: "Username must not be empty".to_string(),
            });
        }
        if username.chars().count() > USERNAME_MAX_LENGTH {
            return Err(Error::Validation {
                message: format!("Username must be at most {USERNAME_MAX_LENGTH} characters"),
            });
        }
        if !username
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'))
        {
            return Err(Error::Validation {
                message: "Username may only contain letters, digits, '.', '_', '-' and '@'".to_string(),
            });
        }
        Ok(username)
    }

    /// Create a regular user account.
    #[instrument(skip(self, password), err)]
    pub async fn register(&self, username: &str, password: &str) -> Result<UserDBResponse> {
        if !self.allow_registration {
            return Err(Error::Forbidden {
                message: "Registration is disabled".to_string(),
            });
        }
        self.create_user(username, password, Role::User).await
    }

    async fn create_user(&self, username: &str, password: &str, role: Role) -> Result<UserDBResponse> {
        let username = Self::validate_username(username)?;
        validate_password(password, &self.password_config)?;

        let password_hash = self.hash(password).await?;
        let user = self
            .store
            .create_user(&UserCreateDBRequest {
                username: username.to_string(),
                password_hash,
                role,
            })
            .await?;
        info!(user_id = %abbrev_uuid(&user.id), role = %user.role.as_str(), "User created");
        Ok(user)
    }

    /// Make sure the configured administrator exists and holds the superuser role.
    #[instrument(skip(self, password), err)]
    pub async fn ensure_admin(&self, username: &str, password: Option<&str>) -> Result<UserDBResponse> {
        if let Some(user) = self.store.get_user_by_username(username.trim()).await? {
            if user.role == Role::Superuser {
                return Ok(user);
            }
            info!(user_id = %abbrev_uuid(&user.id), "Promoting configured admin to superuser");
            return Ok(self.store.set_user_role(user.id, Role::Superuser).await?);
        }

        let password = password.ok_or_else(|| Error::Internal {
            operation: "create admin user: admin_password is required to create the account".to_string(),
        })?;
        self.create_user(username, password, Role::Superuser).await
    }

    /// Verify credentials and start a session.
    ///
    /// Locked identities are refused before the password is looked at. Unknown usernames verify
    /// against a dummy hash so both failure paths cost the same.
    #[instrument(skip(self, password, device_fingerprint), err)]
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        client_addr: &str,
        device_fingerprint: Option<String>,
    ) -> Result<(UserDBResponse, TokenPair)> {
        let identity = IdentityKey::new(username, client_addr);
        self.lockout.check_allowed(&identity).await?;

        let user = self.store.get_user_by_username(username.trim()).await?;
        let hash = user
            .as_ref()
            .map(|u| u.password_hash.clone())
            .unwrap_or_else(|| self.dummy_hash.clone());
        let verified = self.verify(password, hash).await?;

        let user = match user {
            Some(user) if verified && user.is_active => user,
            user => {
                let user_id = user.as_ref().map(|u| u.id);
                let status = self
                    .lockout
                    .record_attempt(&identity, user_id, AttemptOutcome::Failure)
                    .await?;
                debug!(?status, "Login failed");
                return Err(Error::InvalidCredentials);
            }
        };

        self.lockout
            .record_attempt(&identity, Some(user.id), AttemptOutcome::Success)
            .await?;
        if let Err(e) = self.store.record_login(user.id, Utc::now()).await {
            warn!(error = %e, "Failed to record last login");
        }

        let tokens = self.tokens.issue_tokens(&user, device_fingerprint).await?;
        info!(user_id = %abbrev_uuid(&user.id), "User logged in");
        Ok((user, tokens))
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.tokens.refresh(refresh_token).await
    }

    /// End a session, or every session of its owner. Returns how many sessions were revoked.
    #[instrument(skip(self, refresh_token), err)]
    pub async fn logout(&self, refresh_token: &str, everywhere: bool) -> Result<u64> {
        let Some(owner) = self.tokens.revoke(refresh_token).await? else {
            return Ok(0);
        };
        if everywhere {
            Ok(1 + self.tokens.revoke_all_for_user(owner).await?)
        } else {
            Ok(1)
        }
    }

    /// Verify a bearer token and lease a connection for the handler.
    pub async fn authorize(&self, bearer: &str) -> Result<AuthenticatedContext<C>> {
        let claims = self.tokens.validate_access(bearer)?;
        let connection = self.pool.lease().await?;
        Ok(AuthenticatedContext { claims, connection })
    }

    /// Admission and authorization for callers outside the HTTP stack.
    pub async fn authenticate(&self, meta: &RequestMeta) -> Result<AuthenticatedContext<C>> {
        self.admit(&meta.client_addr, meta.class).await?;
        let bearer = meta
            .authorization
            .as_deref()
            .and_then(bearer_token)
            .ok_or(Error::Unauthenticated { message: None })?;
        self.authorize(bearer).await
    }

    /// Soft-disable a user and revoke all their sessions.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn disable_user(&self, user_id: UserId) -> Result<u64> {
        self.store.set_user_active(user_id, false).await?;
        let revoked = self
            .store
            .revoke_all_for_user(user_id, RevocationReason::UserDisabled, Utc::now())
            .await?;
        info!(revoked, "User disabled");
        Ok(revoked)
    }

    pub async fn enable_user(&self, user_id: UserId) -> Result<UserDBResponse> {
        Ok(self.store.set_user_active(user_id, true).await?)
    }
}

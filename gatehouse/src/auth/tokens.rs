//! Access and refresh token lifecycle.
//!
//! Access tokens are short-lived HS256 JWTs verified without touching any store. Refresh
//! tokens are opaque random strings; only their SHA-256 digest is persisted. Every successful
//! refresh rotates the token: the presented row is revoked and a successor inserted in one
//! atomic step. Presenting a token that was already rotated means two parties hold it, so the
//! user's entire token family is revoked.

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::password::{generate_refresh_token, hash_refresh_token},
    config::{Config, TokenConfig},
    db::{
        models::{
            refresh_tokens::{RefreshTokenCreateDBRequest, RefreshTokenDBResponse, RevocationReason, RotationOutcome},
            users::UserDBResponse,
        },
        store::CredentialStore,
    },
    errors::{Error, Result},
    types::{RefreshTokenId, Role, UserId, abbrev_uuid},
};

/// Claims carried by an access token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Claims {
    /// User ID
    #[schema(value_type = String, format = "uuid")]
    pub sub: UserId,
    pub role: Role,
    /// Refresh token (session) this access token was issued alongside
    #[schema(value_type = String, format = "uuid")]
    pub sid: RefreshTokenId,
    /// Unique token ID
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Issued credentials
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    /// Opaque; present it to `/auth/refresh` to obtain a new pair
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Refresh token lifetime in seconds
    pub refresh_expires_in: u64,
}

pub struct TokenService {
    store: Arc<dyn CredentialStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: TokenConfig,
}

impl TokenService {
    pub fn new(config: &Config, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let secret_key = config.secret_key.as_ref().ok_or_else(|| Error::Internal {
            operation: "create token service: secret_key is required".to_string(),
        })?;

        Ok(Self {
            store,
            encoding_key: EncodingKey::from_secret(secret_key.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret_key.as_bytes()),
            config: config.auth.tokens.clone(),
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    fn skew(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.clock_skew).unwrap_or_default()
    }

    fn ttl(duration: std::time::Duration) -> chrono::Duration {
        chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
    }

    fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key).map_err(|e| Error::Internal {
            operation: format!("create JWT: {e}"),
        })
    }

    fn access_claims(&self, user_id: UserId, role: Role, sid: RefreshTokenId, now: DateTime<Utc>) -> Claims {
        let exp = now + Self::ttl(self.config.access_ttl);
        Claims {
            sub: user_id,
            role,
            sid,
            jti: Uuid::new_v4(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: self.config.issuer.clone(),
        }
    }

    fn pair(&self, access_token: String, refresh_token: String) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl.as_secs(),
            refresh_expires_in: self.config.refresh_ttl.as_secs(),
        }
    }

    fn new_refresh_row(
        &self,
        user_id: UserId,
        device_fingerprint: Option<String>,
        now: DateTime<Utc>,
    ) -> (String, RefreshTokenCreateDBRequest) {
        let raw = generate_refresh_token();
        let request = RefreshTokenCreateDBRequest {
            id: Uuid::new_v4(),
            user_id,
            token_hash: hash_refresh_token(&raw),
            issued_at: now,
            expires_at: now + Self::ttl(self.config.refresh_ttl),
            device_fingerprint,
        };
        (raw, request)
    }

    /// Issue a fresh access/refresh pair, starting a new session.
    #[instrument(skip(self, user, device_fingerprint), fields(user_id = %abbrev_uuid(&user.id)), err)]
    pub async fn issue_tokens(&self, user: &UserDBResponse, device_fingerprint: Option<String>) -> Result<TokenPair> {
        if !user.is_active {
            return Err(Error::Unauthenticated {
                message: Some("Account is disabled".to_string()),
            });
        }

        let now = Utc::now();
        let (raw, request) = self.new_refresh_row(user.id, device_fingerprint, now);
        let row = self.store.insert_refresh_token(&request).await?;
        let access = self.sign(&self.access_claims(user.id, user.role, row.id, now))?;

        Ok(self.pair(access, raw))
    }

    /// Verify an access token's signature, issuer and expiry (with clock skew).
    pub fn validate_access(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.clock_skew.as_secs();
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let token_data = decode::<Claims>(token, &self.decoding_key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => Error::TokenExpired,

            // Client errors - malformed or forged tokens
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_)
            | ErrorKind::InvalidAlgorithm => Error::InvalidToken,

            // Server errors - key issues, internal failures
            ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::RsaFailedSigning
            | ErrorKind::InvalidAlgorithmName
            | ErrorKind::InvalidKeyFormat
            | ErrorKind::MissingAlgorithm
            | ErrorKind::Crypto(_) => Error::Internal {
                operation: format!("JWT verification: {e}"),
            },

            _ => Error::Internal {
                operation: format!("JWT verification (unknown error): {e}"),
            },
        })?;

        Ok(token_data.claims)
    }

    /// Exchange a refresh token for a new pair, rotating it.
    #[instrument(skip_all, err)]
    pub async fn refresh(&self, raw: &str) -> Result<TokenPair> {
        let Some(token) = self.store.find_refresh_token_by_hash(&hash_refresh_token(raw)).await? else {
            return Err(Error::InvalidToken);
        };
        let now = Utc::now();

        if token.revoked {
            return Err(self.handle_revoked_presentation(&token, now).await);
        }

        if now > token.expires_at + self.skew() {
            return Err(Error::TokenExpired);
        }

        let user = match self.store.get_user_by_id(token.user_id).await? {
            Some(user) if user.is_active => user,
            _ => {
                let revoked = self
                    .store
                    .revoke_all_for_user(token.user_id, RevocationReason::UserDisabled, now)
                    .await?;
                info!(user_id = %abbrev_uuid(&token.user_id), revoked, "Refresh refused for disabled user");
                return Err(Error::Unauthenticated {
                    message: Some("Account is disabled".to_string()),
                });
            }
        };

        let (new_raw, successor) = self.new_refresh_row(user.id, token.device_fingerprint.clone(), now);
        match self.store.rotate_refresh_token(token.id, &successor).await? {
            RotationOutcome::Rotated(row) => {
                let access = self.sign(&self.access_claims(user.id, user.role, row.id, now))?;
                Ok(self.pair(access, new_raw))
            }
            RotationOutcome::AlreadyRevoked => {
                // A concurrent request rotated the same token first
                let revoked = self
                    .store
                    .revoke_all_for_user(user.id, RevocationReason::ReuseDetected, now)
                    .await?;
                warn!(
                    security_event = "refresh_token_reuse",
                    user_id = %abbrev_uuid(&user.id),
                    token_id = %abbrev_uuid(&token.id),
                    revoked,
                    "Concurrent refresh token rotation detected; revoked all sessions"
                );
                Err(Error::ReuseDetected)
            }
        }
    }

    async fn handle_revoked_presentation(&self, token: &RefreshTokenDBResponse, now: DateTime<Utc>) -> Error {
        let revoked = match self
            .store
            .revoke_all_for_user(token.user_id, RevocationReason::ReuseDetected, now)
            .await
        {
            Ok(revoked) => revoked,
            Err(e) => return e.into(),
        };

        match token.revocation_reason {
            Some(RevocationReason::Rotated) => {
                warn!(
                    security_event = "refresh_token_reuse",
                    user_id = %abbrev_uuid(&token.user_id),
                    token_id = %abbrev_uuid(&token.id),
                    revoked,
                    "Rotated refresh token presented again; revoked all sessions"
                );
                Error::ReuseDetected
            }
            reason => {
                info!(
                    user_id = %abbrev_uuid(&token.user_id),
                    token_id = %abbrev_uuid(&token.id),
                    reason = ?reason,
                    revoked,
                    "Revoked refresh token presented"
                );
                Error::Revoked
            }
        }
    }

    /// Revoke a single session. Returns its owner if the token was live until now.
    #[instrument(skip_all, err)]
    pub async fn revoke(&self, raw: &str) -> Result<Option<UserId>> {
        let Some(token) = self.store.find_refresh_token_by_hash(&hash_refresh_token(raw)).await? else {
            return Ok(None);
        };
        let revoked = self
            .store
            .revoke_refresh_token(token.id, RevocationReason::Logout, Utc::now())
            .await?;
        Ok(revoked.then_some(token.user_id))
    }

    /// Revoke every live session of a user. Returns how many were revoked.
    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn revoke_all_for_user(&self, user_id: UserId) -> Result<u64> {
        Ok(self
            .store
            .revoke_all_for_user(user_id, RevocationReason::LogoutAll, Utc::now())
            .await?)
    }

    /// Live (unrevoked, unexpired) sessions of a user, newest first
    pub async fn list_sessions(&self, user_id: UserId) -> Result<Vec<RefreshTokenDBResponse>> {
        Ok(self.store.list_active_refresh_tokens(user_id, Utc::now()).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryCredentialStore;
    use crate::db::models::users::UserCreateDBRequest;
    use crate::test_utils::create_test_config;
    use std::time::Duration;

    async fn setup() -> (TokenService, Arc<MemoryCredentialStore>, UserDBResponse) {
        let store = Arc::new(MemoryCredentialStore::new());
        let user = store
            .create_user(&UserCreateDBRequest {
                username: "alice".to_string(),
                password_hash: "unused".to_string(),
                role: Role::User,
            })
            .await
            .unwrap();
        let service = TokenService::new(&create_test_config(), store.clone()).unwrap();
        (service, store, user)
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let (service, store, user) = setup().await;
        let pair = service.issue_tokens(&user, Some("laptop".to_string())).await.unwrap();

        let claims = service.validate_access(&pair.access_token).unwrap();
        assert_eq!(claims.sub, user.id);
        assert_eq!(claims.role, Role::User);
        assert_eq!(claims.iss, "gatehouse");
        assert_eq!(pair.token_type, "Bearer");

        let sessions = service.list_sessions(user.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, claims.sid);
        assert_eq!(sessions[0].device_fingerprint.as_deref(), Some("laptop"));

        // Only the digest is stored
        let row = store
            .find_refresh_token_by_hash(&hash_refresh_token(&pair.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(row.token_hash, pair.refresh_token);
    }

    #[tokio::test]
    async fn test_inactive_user_cannot_get_tokens() {
        let (service, store, user) = setup().await;
        let user = store.set_user_active(user.id, false).await.unwrap();
        assert!(matches!(
            service.issue_tokens(&user, None).await,
            Err(Error::Unauthenticated { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_access_token() {
        let (service, _, user) = setup().await;
        let past = Utc::now() - chrono::Duration::hours(2);
        let token = service.sign(&service.access_claims(user.id, user.role, Uuid::new_v4(), past)).unwrap();
        assert!(matches!(service.validate_access(&token), Err(Error::TokenExpired)));
    }

    #[tokio::test]
    async fn test_clock_skew_tolerated() {
        let (service, _, user) = setup().await;
        // Expired two seconds ago, within the five second skew
        let now = Utc::now();
        let mut claims = service.access_claims(user.id, user.role, Uuid::new_v4(), now);
        claims.exp = (now - chrono::Duration::seconds(2)).timestamp();
        let token = service.sign(&claims).unwrap();
        assert!(service.validate_access(&token).is_ok());
    }

    #[tokio::test]
    async fn test_tampered_and_foreign_tokens_rejected() {
        let (service, _, user) = setup().await;
        let pair = service.issue_tokens(&user, None).await.unwrap();

        let mut tampered = pair.access_token.clone();
        tampered.pop();
        tampered.push(if pair.access_token.ends_with('A') { 'B' } else { 'A' });
        assert!(matches!(service.validate_access(&tampered), Err(Error::InvalidToken)));
        assert!(matches!(service.validate_access("not.a.jwt"), Err(Error::InvalidToken)));

        let mut other_config = create_test_config();
        other_config.auth.tokens.issuer = "someone-else".to_string();
        let (_, store, _) = setup().await;
        let foreign = TokenService::new(&other_config, store).unwrap();
        let token = foreign
            .sign(&foreign.access_claims(user.id, user.role, Uuid::new_v4(), Utc::now()))
            .unwrap();
        assert!(matches!(service.validate_access(&token), Err(Error::InvalidToken)));
    }

    #[tokio::test]
    async fn test_refresh_rotates() {
        let (service, _, user) = setup().await;
        let first = service.issue_tokens(&user, None).await.unwrap();
        let second = service.refresh(&first.refresh_token).await.unwrap();

        assert_ne!(first.refresh_token, second.refresh_token);
        let claims = service.validate_access(&second.access_token).unwrap();
        let sessions = service.list_sessions(user.id).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, claims.sid);
    }

    #[tokio::test]
    async fn test_reuse_of_rotated_token_revokes_family() {
        let (service, _, user) = setup().await;
        let first = service.issue_tokens(&user, None).await.unwrap();
        let second = service.refresh(&first.refresh_token).await.unwrap();
        // An unrelated session of the same user
        let other = service.issue_tokens(&user, None).await.unwrap();

        assert!(matches!(service.refresh(&first.refresh_token).await, Err(Error::ReuseDetected)));

        // Every live token of the user is gone
        assert!(service.list_sessions(user.id).await.unwrap().is_empty());
        assert!(matches!(service.refresh(&second.refresh_token).await, Err(Error::Revoked)));
        assert!(matches!(service.refresh(&other.refresh_token).await, Err(Error::Revoked)));
    }

    #[tokio::test]
    async fn test_logged_out_token_is_revoked() {
        let (service, _, user) = setup().await;
        let pair = service.issue_tokens(&user, None).await.unwrap();
        assert_eq!(service.revoke(&pair.refresh_token).await.unwrap(), Some(user.id));
        assert!(matches!(service.refresh(&pair.refresh_token).await, Err(Error::Revoked)));
        assert_eq!(service.revoke(&pair.refresh_token).await.unwrap(), None);
        // Unknown tokens are a no-op for logout
        assert_eq!(service.revoke("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_unknown_refresh_token() {
        let (service, _, _) = setup().await;
        assert!(matches!(service.refresh("garbage").await, Err(Error::InvalidToken)));
    }

    #[tokio::test]
    async fn test_expired_refresh_token() {
        let (service, store, user) = setup().await;
        let raw = generate_refresh_token();
        let issued_at = Utc::now() - chrono::Duration::days(30);
        store
            .insert_refresh_token(&RefreshTokenCreateDBRequest {
                id: Uuid::new_v4(),
                user_id: user.id,
                token_hash: hash_refresh_token(&raw),
                issued_at,
                expires_at: issued_at + chrono::Duration::days(14),
                device_fingerprint: None,
            })
            .await
            .unwrap();

        assert!(matches!(service.refresh(&raw).await, Err(Error::TokenExpired)));
    }

    #[tokio::test]
    async fn test_disabled_user_refresh_revokes_family() {
        let (service, store, user) = setup().await;
        let pair = service.issue_tokens(&user, None).await.unwrap();
        store.set_user_active(user.id, false).await.unwrap();

        assert!(matches!(service.refresh(&pair.refresh_token).await, Err(Error::Unauthenticated { .. })));
        let row = store
            .find_refresh_token_by_hash(&hash_refresh_token(&pair.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.revocation_reason, Some(RevocationReason::UserDisabled));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_single_winner() {
        let (service, _, user) = setup().await;
        let service = Arc::new(service);
        let pair = service.issue_tokens(&user, None).await.unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let raw = pair.refresh_token.clone();
                tokio::spawn(async move { service.refresh(&raw).await })
            })
            .collect();

        let mut successes = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => successes += 1,
                Err(Error::ReuseDetected | Error::Revoked) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        // At most one rotation wins; the losers trip reuse detection
        assert!(successes <= 1);
        assert!(service.list_sessions(user.id).await.unwrap().len() <= 1);
    }

    #[test]
    fn test_claims_schema_documents_ids_as_uuid_strings() {
        let schema = serde_json::to_value(<Claims as utoipa::PartialSchema>::schema()).unwrap();
        for field in ["sub", "sid"] {
            assert_eq!(schema["properties"][field]["type"], "string");
            assert_eq!(schema["properties"][field]["format"], "uuid");
        }
    }

    #[test]
    fn test_ttl_conversion() {
        assert_eq!(TokenService::ttl(Duration::from_secs(60)), chrono::Duration::seconds(60));
    }
}

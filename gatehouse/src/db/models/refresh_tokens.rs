//! Database models for refresh tokens.
//!
//! Only the SHA-256 digest of a refresh token is persisted. Rows are never updated except to
//! revoke them, and every rotation links the revoked row to its successor through
//! `replaced_by`, so a token family can be walked after the fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use utoipa::ToSchema;

use crate::types::{RefreshTokenId, UserId};

/// Why a refresh token stopped being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "revocation_reason", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    /// Exchanged for a successor; presenting it again is reuse
    Rotated,
    /// The holder signed out this session
    Logout,
    /// The holder signed out every session
    LogoutAll,
    /// Revoked as part of a family after reuse was detected
    ReuseDetected,
    /// The owning user was disabled
    UserDisabled,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::Logout => "logout",
            RevocationReason::LogoutAll => "logout_all",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::UserDisabled => "user_disabled",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request for inserting a refresh token row
#[derive(Debug, Clone)]
pub struct RefreshTokenCreateDBRequest {
    /// Generated by the caller so it can be embedded in the access token as `sid`
    pub id: RefreshTokenId,
    pub user_id: UserId,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_fingerprint: Option<String>,
}

/// Database entity model
#[derive(Debug, Clone, FromRow)]
pub struct RefreshTokenDBResponse {
    pub id: RefreshTokenId,
    pub user_id: UserId,
    pub token_hash: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<RevocationReason>,
    pub replaced_by: Option<RefreshTokenId>,
    pub device_fingerprint: Option<String>,
}

impl RefreshTokenDBResponse {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Result of a compare-and-swap rotation
#[derive(Debug, Clone)]
pub enum RotationOutcome {
    /// The predecessor was live and is now revoked; here is its successor
    Rotated(RefreshTokenDBResponse),
    /// Someone else revoked the predecessor first; nothing was written
    AlreadyRevoked,
}

//! API request/response models for users and their sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::db::models::{refresh_tokens::RefreshTokenDBResponse, users::UserDBResponse};
use crate::types::{RefreshTokenId, Role, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub username: String,
    pub role: Role,
    pub is_active: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<UserDBResponse> for UserResponse {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            username: db.username,
            role: db.role,
            is_active: db.is_active,
            last_login: db.last_login,
            created_at: db.created_at,
        }
    }
}

/// The bearer's identity as carried by the access token
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentUserResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    pub role: Role,
    /// Session the access token belongs to
    #[schema(value_type = String, format = "uuid")]
    pub session_id: RefreshTokenId,
    pub expires_at: DateTime<Utc>,
}

/// An active refresh token, without any token material
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: RefreshTokenId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_fingerprint: Option<String>,
    /// Whether the calling access token was issued with this session
    pub current: bool,
}

impl SessionResponse {
    pub fn from_db(db: RefreshTokenDBResponse, current_session: RefreshTokenId) -> Self {
        Self {
            current: db.id == current_session,
            id: db.id,
            issued_at: db.issued_at,
            expires_at: db.expires_at,
            device_fingerprint: db.device_fingerprint,
        }
    }
}

//! Database models for the login attempt log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::{LoginAttemptId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "login_outcome", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct LoginAttemptCreateDBRequest {
    pub identity_key: String,
    /// Set when the username resolved to an account
    pub user_id: Option<UserId>,
    pub outcome: AttemptOutcome,
    pub attempted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct LoginAttemptDBResponse {
    pub id: LoginAttemptId,
    pub identity_key: String,
    pub user_id: Option<UserId>,
    pub outcome: AttemptOutcome,
    pub attempted_at: DateTime<Utc>,
}

//! Database repository for the login attempt log.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;
use uuid::Uuid;

use crate::db::{
    errors::Result,
    models::login_attempts::{LoginAttemptCreateDBRequest, LoginAttemptDBResponse},
};

pub struct LoginAttempts<'c> {
    db: &'c mut PgConnection,
}

impl<'c> LoginAttempts<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(outcome = ?request.outcome), err)]
    pub async fn create(&mut self, request: &LoginAttemptCreateDBRequest) -> Result<LoginAttemptDBResponse> {
        let attempt = sqlx::query_as::<_, LoginAttemptDBResponse>(
            r#"
            INSERT INTO login_attempts (id, identity_key, user_id, outcome, attempted_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, identity_key, user_id, outcome, attempted_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.identity_key)
        .bind(request.user_id)
        .bind(request.outcome)
        .bind(request.attempted_at)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(attempt)
    }

    /// Most recent attempts for an identity, newest first
    #[instrument(skip(self), err)]
    pub async fn list_for_identity(&mut self, identity_key: &str, limit: i64) -> Result<Vec<LoginAttemptDBResponse>> {
        let attempts = sqlx::query_as::<_, LoginAttemptDBResponse>(
            r#"
            SELECT id, identity_key, user_id, outcome, attempted_at
            FROM login_attempts
            WHERE identity_key = $1
            ORDER BY attempted_at DESC
            LIMIT $2
            "#,
        )
        .bind(identity_key)
        .bind(limit)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(attempts)
    }

    #[instrument(skip(self), err)]
    pub async fn purge_older_than(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM login_attempts WHERE attempted_at < $1")
            .bind(before)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

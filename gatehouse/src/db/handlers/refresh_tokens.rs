//! Database repository for refresh tokens.

use chrono::{DateTime, Utc};
use sqlx::{Connection, PgConnection};
use tracing::instrument;

use crate::{
    db::{
        errors::Result,
        models::refresh_tokens::{RefreshTokenCreateDBRequest, RefreshTokenDBResponse, RevocationReason, RotationOutcome},
    },
    types::{RefreshTokenId, UserId, abbrev_uuid},
};

const TOKEN_COLUMNS: &str =
    "id, user_id, token_hash, issued_at, expires_at, revoked, revoked_at, revocation_reason, replaced_by, device_fingerprint";

pub struct RefreshTokens<'c> {
    db: &'c mut PgConnection,
}

impl<'c> RefreshTokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&request.user_id)), err)]
    pub async fn create(&mut self, request: &RefreshTokenCreateDBRequest) -> Result<RefreshTokenDBResponse> {
        insert(&mut *self.db, request).await
    }

    #[instrument(skip_all, err)]
    pub async fn get_by_hash(&mut self, token_hash: &str) -> Result<Option<RefreshTokenDBResponse>> {
        let token =
            sqlx::query_as::<_, RefreshTokenDBResponse>(&format!("SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE token_hash = $1"))
                .bind(token_hash)
                .fetch_optional(&mut *self.db)
                .await?;

        Ok(token)
    }

    /// Revoke `old_id` and insert its successor in one transaction.
    ///
    /// The revocation is conditional on the row still being live. If another request got there
    /// first, nothing is written and [`RotationOutcome::AlreadyRevoked`] is returned.
    #[instrument(skip(self, successor), fields(token_id = %abbrev_uuid(&old_id)), err)]
    pub async fn rotate(
        &mut self,
        old_id: RefreshTokenId,
        successor: &RefreshTokenCreateDBRequest,
    ) -> Result<RotationOutcome> {
        let mut tx = self.db.begin().await?;

        let revoked = sqlx::query(
            r#"
            UPDATE refresh_tokens
            SET revoked = TRUE, revoked_at = $2, revocation_reason = $3, replaced_by = $4
            WHERE id = $1 AND revoked = FALSE
            "#,
        )
        .bind(old_id)
        .bind(successor.issued_at)
        .bind(RevocationReason::Rotated)
        .bind(successor.id)
        .execute(&mut *tx)
        .await?;

        if revoked.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(RotationOutcome::AlreadyRevoked);
        }

        let token = insert(&mut *tx, successor).await?;
        tx.commit().await?;

        Ok(RotationOutcome::Rotated(token))
    }

    /// Returns whether a live row was revoked
    #[instrument(skip(self), fields(token_id = %abbrev_uuid(&id)), err)]
    pub async fn revoke(&mut self, id: RefreshTokenId, reason: RevocationReason, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2, revocation_reason = $3 WHERE id = $1 AND revoked = FALSE",
        )
        .bind(id)
        .bind(at)
        .bind(reason)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn revoke_all_for_user(&mut self, user_id: UserId, reason: RevocationReason, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2, revocation_reason = $3 WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .bind(at)
        .bind(reason)
        .execute(&mut *self.db)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn list_active_for_user(&mut self, user_id: UserId, now: DateTime<Utc>) -> Result<Vec<RefreshTokenDBResponse>> {
        let tokens = sqlx::query_as::<_, RefreshTokenDBResponse>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM refresh_tokens WHERE user_id = $1 AND revoked = FALSE AND expires_at > $2 ORDER BY issued_at DESC"
        ))
        .bind(user_id)
        .bind(now)
        .fetch_all(&mut *self.db)
        .await?;

        Ok(tokens)
    }

    /// Delete rows that expired before `before`. Revocation lineage older than that is no longer
    /// useful for reuse detection because the tokens could not be presented anyway.
    #[instrument(skip(self), err)]
    pub async fn purge_expired(&mut self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < $1")
            .bind(before)
            .execute(&mut *self.db)
            .await?;

        Ok(result.rows_affected())
    }
}

async fn insert(conn: &mut PgConnection, request: &RefreshTokenCreateDBRequest) -> Result<RefreshTokenDBResponse> {
    let token = sqlx::query_as::<_, RefreshTokenDBResponse>(&format!(
        r#"
        INSERT INTO refresh_tokens (id, user_id, token_hash, issued_at, expires_at, device_fingerprint)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING {TOKEN_COLUMNS}
        "#
    ))
    .bind(request.id)
    .bind(request.user_id)
    .bind(&request.token_hash)
    .bind(request.issued_at)
    .bind(request.expires_at)
    .bind(&request.device_fingerprint)
    .fetch_one(conn)
    .await?;

    Ok(token)
}

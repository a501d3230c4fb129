//! HTTP handlers for the caller's identity and sessions, and administrative user actions.

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};

use crate::{
    AppState,
    api::models::{
        system::DisableUserResponse,
        users::{CurrentUserResponse, SessionResponse, UserResponse},
    },
    auth::gateway::AuthenticatedContext,
    db::pools::Connector,
    errors::{Error, ErrorBody, Result},
    types::UserId,
};

/// Get the authenticated caller
#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "users",
    responses(
        (status = 200, description = "The caller's identity", body = CurrentUserResponse),
        (status = 401, description = "Missing, invalid or expired access token", body = ErrorBody),
        (status = 503, description = "No database connection available", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all, fields(user_id = %crate::types::abbrev_uuid(&context.claims.sub)))]
pub async fn get_me<C: Connector>(
    State(state): State<AppState<C>>,
    mut context: AuthenticatedContext<C>,
) -> Result<Json<CurrentUserResponse>> {
    // The handler owns a leased connection for its whole duration; make sure it is usable
    if !state.gateway.pool().connector().is_healthy(&mut context.connection).await {
        context.connection.mark_broken();
        return Err(Error::StoreUnavailable {
            operation: "verify leased connection".to_string(),
        });
    }

    let claims = &context.claims;
    Ok(Json(CurrentUserResponse {
        id: claims.sub,
        role: claims.role,
        session_id: claims.sid,
        expires_at: DateTime::<Utc>::from_timestamp(claims.exp, 0).unwrap_or_default(),
    }))
}

/// List the caller's active sessions
#[utoipa::path(
    get,
    path = "/auth/sessions",
    tag = "users",
    responses(
        (status = 200, description = "Active sessions, newest first", body = Vec<SessionResponse>),
        (status = 401, description = "Missing, invalid or expired access token", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn list_sessions<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
) -> Result<Json<Vec<SessionResponse>>> {
    let sessions = state.gateway.tokens().list_sessions(context.user_id()).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|session| SessionResponse::from_db(session, context.claims.sid))
            .collect(),
    ))
}

/// Disable a user and revoke all of their sessions
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/disable",
    tag = "admin",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "User disabled", body = DisableUserResponse),
        (status = 403, description = "Administrator role required", body = ErrorBody),
        (status = 404, description = "User not found", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn disable_user<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
    Path(user_id): Path<UserId>,
) -> Result<Json<DisableUserResponse>> {
    context.require_admin()?;
    if user_id == context.user_id() {
        return Err(Error::Validation {
            message: "Administrators cannot disable themselves".to_string(),
        });
    }
    let revoked = state.gateway.disable_user(user_id).await?;
    Ok(Json(DisableUserResponse { revoked }))
}

/// Re-enable a disabled user
#[utoipa::path(
    post,
    path = "/admin/users/{user_id}/enable",
    tag = "admin",
    params(("user_id" = String, Path, description = "User ID")),
    responses(
        (status = 200, description = "User enabled", body = UserResponse),
        (status = 403, description = "Administrator role required", body = ErrorBody),
        (status = 404, description = "User not found", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn enable_user<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
    Path(user_id): Path<UserId>,
) -> Result<Json<UserResponse>> {
    context.require_admin()?;
    Ok(Json(state.gateway.enable_user(user_id).await?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_app, create_test_config, login_admin, login_user, register_user};
    use axum::http::StatusCode;
    use serde_json::Value;

    #[tokio::test]
    async fn test_me_requires_bearer() {
        let (server, _state) = create_test_app(create_test_config());

        let response = server.get("/auth/me").await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server.get("/auth/me").authorization_bearer("not-a-token").await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_token");
    }

    #[tokio::test]
    async fn test_me_leases_and_returns_connection() {
        let (server, state) = create_test_app(create_test_config());
        let user = register_user(&server, "alice", "correct-horse-battery").await;
        let tokens = login_user(&server, "alice", "correct-horse-battery").await;

        let response = server.get("/auth/me").authorization_bearer(&tokens.access_token).await;
        response.assert_status(StatusCode::OK);
        let body: CurrentUserResponse = response.json();
        assert_eq!(body.id, user.id);

        assert_eq!(state.gateway.pool().active(), 0);
        assert_eq!(state.gateway.pool().connector().opened(), 1);
    }

    #[tokio::test]
    async fn test_me_with_broken_connection() {
        let (server, state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        let tokens = login_user(&server, "alice", "correct-horse-battery").await;

        state.gateway.pool().connector().set_healthy(false);
        let response = server.get("/auth/me").authorization_bearer(&tokens.access_token).await;
        response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        assert!(response.headers().get("retry-after").is_some());
    }

    #[tokio::test]
    async fn test_sessions_marks_current() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        let first = login_user(&server, "alice", "correct-horse-battery").await;
        let _second = login_user(&server, "alice", "correct-horse-battery").await;

        let response = server.get("/auth/sessions").authorization_bearer(&first.access_token).await;
        response.assert_status(StatusCode::OK);
        let sessions: Vec<SessionResponse> = response.json();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.iter().filter(|s| s.current).count(), 1);
    }

    #[tokio::test]
    async fn test_disable_user_requires_admin() {
        let (server, _state) = create_test_app(create_test_config());
        let bob = register_user(&server, "bob", "correct-horse-battery").await;
        let tokens = login_user(&server, "bob", "correct-horse-battery").await;

        let response = server
            .post(&format!("/admin/users/{}/disable", bob.id))
            .authorization_bearer(&tokens.access_token)
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_admin_disables_and_enables_user() {
        let (server, state) = create_test_app(create_test_config());
        let admin = login_admin(&server, &state).await;
        let bob = register_user(&server, "bob", "correct-horse-battery").await;
        let bob_tokens = login_user(&server, "bob", "correct-horse-battery").await;

        let response = server
            .post(&format!("/admin/users/{}/disable", bob.id))
            .authorization_bearer(&admin.access_token)
            .await;
        response.assert_status(StatusCode::OK);
        let body: DisableUserResponse = response.json();
        assert_eq!(body.revoked, 1);

        let response = server
            .post("/auth/refresh")
            .json(&serde_json::json!({"refresh_token": bob_tokens.refresh_token}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);

        let response = server
            .post(&format!("/admin/users/{}/enable", bob.id))
            .authorization_bearer(&admin.access_token)
            .await;
        response.assert_status(StatusCode::OK);
        let body: UserResponse = response.json();
        assert!(body.is_active);
    }

    #[tokio::test]
    async fn test_disable_unknown_user() {
        let (server, state) = create_test_app(create_test_config());
        let admin = login_admin(&server, &state).await;

        let response = server
            .post(&format!("/admin/users/{}/disable", uuid::Uuid::new_v4()))
            .authorization_bearer(&admin.access_token)
            .await;
        response.assert_status(StatusCode::NOT_FOUND);
    }
}

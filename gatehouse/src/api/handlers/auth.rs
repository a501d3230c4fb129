//! HTTP handlers for registration, login, token refresh and logout.

use axum::{Json, extract::State, http::StatusCode};

use crate::{
    AppState,
    api::models::{
        auth::{LoginRequest, LoginResponse, LogoutRequest, LogoutResponse, RefreshRequest, RegisterRequest},
        users::UserResponse,
    },
    auth::{context::ClientAddr, tokens::TokenPair},
    db::pools::Connector,
    errors::{ErrorBody, Result},
};

/// Register a new user account
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    tag = "authentication",
    responses(
        (status = 201, description = "User registered", body = UserResponse),
        (status = 400, description = "Invalid username or password", body = ErrorBody),
        (status = 403, description = "Registration is disabled", body = ErrorBody),
        (status = 409, description = "Username already taken", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn register<C: Connector>(
    State(state): State<AppState<C>>,
    Json(request): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserResponse>)> {
    let user = state.gateway.register(&request.username, &request.password).await?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

/// Login with username and password
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 423, description = "Too many failed attempts; see Retry-After", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
        (status = 503, description = "Lockout store unavailable", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all, fields(client = %client.as_str()))]
pub async fn login<C: Connector>(
    State(state): State<AppState<C>>,
    client: ClientAddr,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    let (user, tokens) = state
        .gateway
        .login(&request.username, &request.password, client.as_str(), request.device_fingerprint)
        .await?;

    Ok(Json(LoginResponse {
        user: user.into(),
        tokens,
    }))
}

/// Exchange a refresh token for a new token pair
///
/// The presented refresh token is revoked and replaced. Presenting it again afterwards signs
/// the user out everywhere.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "New token pair", body = TokenPair),
        (status = 401, description = "Token invalid, expired, revoked or reused", body = ErrorBody),
        (status = 429, description = "Rate limited", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn refresh<C: Connector>(
    State(state): State<AppState<C>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    Ok(Json(state.gateway.refresh(&request.refresh_token).await?))
}

/// Revoke a refresh token, or all of its owner's tokens
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    tag = "authentication",
    responses(
        (status = 200, description = "Sessions revoked", body = LogoutResponse),
        (status = 429, description = "Rate limited", body = ErrorBody),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout<C: Connector>(
    State(state): State<AppState<C>>,
    Json(request): Json<LogoutRequest>,
) -> Result<Json<LogoutResponse>> {
    let revoked = state.gateway.logout(&request.refresh_token, request.everywhere).await?;
    Ok(Json(LogoutResponse { revoked }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_app, create_test_config, login_user, register_user};
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_register_success() {
        let (server, _state) = create_test_app(create_test_config());

        let response = server
            .post("/auth/register")
            .json(&json!({"username": "alice", "password": "correct-horse-battery"}))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: UserResponse = response.json();
        assert_eq!(body.username, "alice");
        assert!(body.is_active);
        assert!(!response.text().contains("argon2"));
    }

    #[tokio::test]
    async fn test_register_conflict_and_validation() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;

        let response = server
            .post("/auth/register")
            .json(&json!({"username": "Alice", "password": "correct-horse-battery"}))
            .await;
        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["error"], "conflict");

        let response = server
            .post("/auth/register")
            .json(&json!({"username": "bob", "password": "short"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_register_disabled() {
        let mut config = create_test_config();
        config.auth.allow_registration = false;
        let (server, _state) = create_test_app(config);

        let response = server
            .post("/auth/register")
            .json(&json!({"username": "alice", "password": "correct-horse-battery"}))
            .await;
        response.assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_login_returns_token_pair() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;

        let response = server
            .post("/auth/login")
            .json(&json!({"username": "alice", "password": "correct-horse-battery", "device_fingerprint": "cli"}))
            .await;
        response.assert_status(StatusCode::OK);

        let body: LoginResponse = response.json();
        assert_eq!(body.user.username, "alice");
        assert_eq!(body.tokens.token_type, "Bearer");
        assert_eq!(body.tokens.expires_in, 15 * 60);
        assert!(!body.tokens.refresh_token.is_empty());
    }

    #[tokio::test]
    async fn test_login_wrong_password() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;

        let response = server
            .post("/auth/login")
            .json(&json!({"username": "alice", "password": "not-the-password"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn test_refresh_and_logout() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        let tokens = login_user(&server, "alice", "correct-horse-battery").await;

        let response = server
            .post("/auth/refresh")
            .json(&json!({"refresh_token": tokens.refresh_token}))
            .await;
        response.assert_status(StatusCode::OK);
        let rotated: TokenPair = response.json();
        assert_ne!(rotated.refresh_token, tokens.refresh_token);

        let response = server
            .post("/auth/logout")
            .json(&json!({"refresh_token": rotated.refresh_token}))
            .await;
        response.assert_status(StatusCode::OK);
        let body: LogoutResponse = response.json();
        assert_eq!(body.revoked, 1);

        let response = server
            .post("/auth/refresh")
            .json(&json!({"refresh_token": rotated.refresh_token}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "revoked");
    }

    #[tokio::test]
    async fn test_refresh_unknown_token() {
        let (server, _state) = create_test_app(create_test_config());
        let response = server
            .post("/auth/refresh")
            .json(&json!({"refresh_token": "made-up"}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "invalid_token");
    }
}

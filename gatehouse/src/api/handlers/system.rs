//! HTTP handlers for the health check, pool status and lockout administration.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::system::{HealthResponse, LockoutQuery, LockoutResponse, PoolStatusResponse},
    auth::gateway::AuthenticatedContext,
    db::pools::Connector,
    errors::{ErrorBody, Result},
    types::IdentityKey,
};

/// Liveness check with the current pool snapshot
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "system",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse),
    )
)]
pub async fn healthz<C: Connector>(State(state): State<AppState<C>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        pool: state.gateway.pool().snapshot(),
    })
}

/// Current pool metrics and recent history
#[utoipa::path(
    get,
    path = "/admin/pool",
    tag = "admin",
    responses(
        (status = 200, description = "Pool status", body = PoolStatusResponse),
        (status = 403, description = "Administrator role required", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn pool_status<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
) -> Result<Json<PoolStatusResponse>> {
    context.require_admin()?;
    let pool = state.gateway.pool();
    Ok(Json(PoolStatusResponse {
        current: pool.snapshot(),
        history: pool.history(),
    }))
}

/// Lockout state of a username and client address
#[utoipa::path(
    get,
    path = "/admin/lockout",
    tag = "admin",
    params(LockoutQuery),
    responses(
        (status = 200, description = "Lockout state", body = LockoutResponse),
        (status = 403, description = "Administrator role required", body = ErrorBody),
        (status = 503, description = "Counter store unavailable", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn lockout_status<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
    Query(query): Query<LockoutQuery>,
) -> Result<Json<LockoutResponse>> {
    context.require_admin()?;
    let identity = IdentityKey::new(&query.username, &query.client_addr);
    let status = state.gateway.lockout().status(&identity).await?;
    Ok(Json(LockoutResponse {
        identity: identity.to_string(),
        status,
    }))
}

/// Clear a lock and its failure count
#[utoipa::path(
    delete,
    path = "/admin/lockout",
    tag = "admin",
    params(LockoutQuery),
    responses(
        (status = 204, description = "Lock cleared"),
        (status = 403, description = "Administrator role required", body = ErrorBody),
        (status = 503, description = "Counter store unavailable", body = ErrorBody),
    ),
    security(("BearerAuth" = []))
)]
#[tracing::instrument(skip_all)]
pub async fn unlock<C: Connector>(
    State(state): State<AppState<C>>,
    context: AuthenticatedContext<C>,
    Query(query): Query<LockoutQuery>,
) -> Result<StatusCode> {
    context.require_admin()?;
    let identity = IdentityKey::new(&query.username, &query.client_addr);
    state.gateway.lockout().unlock(&identity).await?;
    tracing::info!(%identity, admin = %crate::types::abbrev_uuid(&context.user_id()), "Identity unlocked");
    Ok(StatusCode::NO_CONTENT)
}

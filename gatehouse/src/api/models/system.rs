//! API models for health reporting and administrative operations.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::auth::lockout::LockoutStatus;
use crate::db::pools::PoolMetricsSnapshot;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub pool: PoolMetricsSnapshot,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PoolStatusResponse {
    pub current: PoolMetricsSnapshot,
    /// Recent samples, oldest first
    pub history: Vec<PoolMetricsSnapshot>,
}

/// Identifies a lockout entry: the username and the client address it was tried from
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LockoutQuery {
    /// Username as typed at login
    pub username: String,
    /// Client address the attempts came from
    pub client_addr: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LockoutResponse {
    pub identity: String,
    pub status: LockoutStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DisableUserResponse {
    /// Sessions revoked by disabling the user
    pub revoked: u64,
}

//! Common type definitions shared across the auth core.
//!
//! This module defines:
//! - Type aliases for entity IDs ([`UserId`], [`RefreshTokenId`])
//! - The [`Role`] enumeration carried in access tokens
//! - [`IdentityKey`], the composite key brute-force tracking is keyed on
//! - [`EndpointClass`], the request-budget classes the rate limiter enforces
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type RefreshTokenId = Uuid;
pub type LoginAttemptId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// Platform role of a user. Stored as an upper-case Postgres enum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
    Superuser,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "USER",
            Role::Admin => "ADMIN",
            Role::Superuser => "SUPERUSER",
        }
    }

    /// Whether this role includes administrative privileges
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::Superuser)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key that login attempts and lockouts are tracked against.
///
/// Composite of the (case-folded) username and the client address, so a flood of
/// failures from one address does not lock the account out for everybody else.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(username: &str, client_addr: &str) -> Self {
        Self(format!("{}@{}", username.trim().to_lowercase(), client_addr.trim()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request-budget class of an endpoint. Each class has its own ceiling and burst allowance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    Authentication,
    Upload,
    AiProcessing,
    General,
    HealthCheck,
    StaticAsset,
}

impl EndpointClass {
    pub const ALL: [EndpointClass; 6] = [
        EndpointClass::Authentication,
        EndpointClass::Upload,
        EndpointClass::AiProcessing,
        EndpointClass::General,
        EndpointClass::HealthCheck,
        EndpointClass::StaticAsset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Authentication => "authentication",
            EndpointClass::Upload => "upload",
            EndpointClass::AiProcessing => "ai_processing",
            EndpointClass::General => "general",
            EndpointClass::HealthCheck => "health_check",
            EndpointClass::StaticAsset => "static_asset",
        }
    }

    /// Classify a request path into its budget class.
    pub fn classify(path: &str) -> Self {
        let path = path.trim_end_matches('/');
        if path == "/healthz" || path == "/health" || path.starts_with("/health/") {
            EndpointClass::HealthCheck
        } else if path.starts_with("/static/") || path.starts_with("/assets/") || path == "/favicon.ico" {
            EndpointClass::StaticAsset
        } else if path == "/auth/config" || path == "/auth/me" || path == "/auth/sessions" {
            EndpointClass::General
        } else if path.starts_with("/auth/") {
            EndpointClass::Authentication
        } else if path.starts_with("/uploads") || path.starts_with("/api/uploads") {
            EndpointClass::Upload
        } else if path.starts_with("/ai/") || path.starts_with("/api/ai/") {
            EndpointClass::AiProcessing
        } else {
            EndpointClass::General
        }
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

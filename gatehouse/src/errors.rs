use crate::counters::CounterError;
use crate::db::errors::DbError;
use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error as ThisError;
use utoipa::ToSchema;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Authentication required but not provided, or the principal is no longer allowed in
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Authenticated, but the role or configuration does not permit the action
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    /// Unknown username or wrong password. Deliberately indistinguishable.
    #[error("Invalid username or password")]
    InvalidCredentials,

    /// Access or refresh token past its expiry (plus skew)
    #[error("Token expired")]
    TokenExpired,

    /// Malformed token, bad signature, wrong issuer, or unknown refresh token
    #[error("Invalid token")]
    InvalidToken,

    /// Refresh token was revoked by logout or administrative action
    #[error("Token revoked")]
    Revoked,

    /// A rotated refresh token was presented again
    #[error("Refresh token reuse detected")]
    ReuseDetected,

    /// Identity is locked out after repeated failures
    #[error("Account temporarily locked, retry after {retry_after:?}")]
    Locked { retry_after: Duration },

    /// Request budget for the endpoint class is exhausted
    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// No pooled connection became available within the acquire timeout
    #[error("Connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    /// A backing store could not be reached
    #[error("Store unavailable during {operation}")]
    StoreUnavailable { operation: String },

    /// Invalid request data
    #[error("{message}")]
    Validation { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Conflict error, e.g., for unique constraint violations
    #[error("Conflict: {message}")]
    Conflict { message: String },
}

/// JSON error body returned to clients.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    /// Stable machine-readable code
    pub error: String,
    /// Human-readable message, safe to show to users
    pub message: String,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. }
            | Error::InvalidCredentials
            | Error::TokenExpired
            | Error::InvalidToken
            | Error::Revoked
            | Error::ReuseDetected => StatusCode::UNAUTHORIZED,
            Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::Locked { .. } => StatusCode::LOCKED,
            Error::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::PoolExhausted { .. } | Error::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::Conflict { .. } => StatusCode::CONFLICT,
                DbError::InvalidReference { .. } | DbError::Rejected { .. } => StatusCode::BAD_REQUEST,
                DbError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Conflict { .. } => StatusCode::CONFLICT,
        }
    }

    /// Stable code for the `error` field of the JSON body
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated { .. } => "unauthenticated",
            Error::Forbidden { .. } => "forbidden",
            Error::InvalidCredentials => "invalid_credentials",
            Error::TokenExpired => "token_expired",
            Error::InvalidToken => "invalid_token",
            Error::Revoked => "revoked",
            Error::ReuseDetected => "reuse_detected",
            Error::Locked { .. } => "locked",
            Error::RateLimited { .. } => "rate_limited",
            Error::PoolExhausted { .. } => "pool_exhausted",
            Error::StoreUnavailable { .. } => "store_unavailable",
            Error::Validation { .. } => "validation_error",
            Error::NotFound { .. } => "not_found",
            Error::Database(DbError::NotFound) => "not_found",
            Error::Database(DbError::Conflict { .. }) | Error::Conflict { .. } => "conflict",
            Error::Database(DbError::InvalidReference { .. } | DbError::Rejected { .. }) => "validation_error",
            Error::Database(DbError::Unavailable(_)) => "store_unavailable",
            Error::Internal { .. } | Error::Database(DbError::Other(_)) | Error::Other(_) => "internal_error",
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::Forbidden { message } => message.clone(),
            Error::InvalidCredentials => "Invalid username or password".to_string(),
            Error::TokenExpired => "Token has expired".to_string(),
            Error::InvalidToken => "Invalid token".to_string(),
            Error::Revoked => "Token has been revoked".to_string(),
            Error::ReuseDetected => "Token reuse detected; all sessions have been signed out".to_string(),
            Error::Locked { retry_after } => {
                format!("Too many failed attempts. Try again in {} seconds", retry_after_secs(*retry_after))
            }
            Error::RateLimited { retry_after } => {
                format!("Rate limit exceeded. Try again in {} seconds", retry_after_secs(*retry_after))
            }
            Error::PoolExhausted { .. } => "Service is busy, please retry shortly".to_string(),
            Error::StoreUnavailable { .. } => "Service temporarily unavailable".to_string(),
            Error::Validation { message } => message.clone(),
            Error::NotFound { resource, id } => {
                format!("{resource} with ID {id} not found")
            }
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Database(db_err) => match db_err {
                DbError::NotFound => "Resource not found".to_string(),
                err if err.is_duplicate_username() => "This username is already taken".to_string(),
                DbError::Conflict { .. } => "Resource already exists".to_string(),
                DbError::InvalidReference { .. } => "Invalid reference to related resource".to_string(),
                DbError::Rejected { .. } => "Invalid data provided".to_string(),
                DbError::Unavailable(_) => "Service temporarily unavailable".to_string(),
                DbError::Other(_) => "Database error occurred".to_string(),
            },
            Error::Other(_) => "Internal server error".to_string(),
            Error::Conflict { message } => message.clone(),
        }
    }

    /// How long a client should wait before retrying, when that is meaningful
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Locked { retry_after } | Error::RateLimited { retry_after } => Some(*retry_after),
            Error::PoolExhausted { .. } | Error::StoreUnavailable { .. } | Error::Database(DbError::Unavailable(_)) => {
                Some(Duration::from_secs(1))
            }
            _ => None,
        }
    }

    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PoolExhausted { .. }
                | Error::StoreUnavailable { .. }
                | Error::RateLimited { .. }
                | Error::Database(DbError::Unavailable(_))
        )
    }
}

/// Whole seconds, rounded up, never zero
fn retry_after_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Database(DbError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::PoolExhausted { .. } | Error::StoreUnavailable { .. } | Error::Database(DbError::Unavailable(_)) => {
                tracing::error!("Resource unavailable: {}", self);
            }
            Error::Database(_) => {
                tracing::warn!("Database constraint error: {}", self);
            }
            Error::ReuseDetected | Error::Locked { .. } => {
                tracing::warn!("Security outcome: {}", self);
            }
            Error::Unauthenticated { .. }
            | Error::Forbidden { .. }
            | Error::InvalidCredentials
            | Error::TokenExpired
            | Error::InvalidToken
            | Error::Revoked => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::RateLimited { .. } | Error::Validation { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
            Error::Conflict { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
        }

        let status = self.status_code();
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.user_message(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after) = self.retry_after()
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs(retry_after).to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

impl From<CounterError> for Error {
    fn from(err: CounterError) -> Self {
        Error::StoreUnavailable {
            operation: format!("counter store: {err}"),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_outcomes_are_unauthorized() {
        for err in [
            Error::InvalidCredentials,
            Error::TokenExpired,
            Error::InvalidToken,
            Error::Revoked,
            Error::ReuseDetected,
        ] {
            assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_locked_maps_to_423_with_retry_after() {
        let err = Error::Locked {
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.status_code(), StatusCode::LOCKED);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::LOCKED);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "2");
    }

    #[test]
    fn test_rate_limited_retry_after_never_zero() {
        let err = Error::RateLimited {
            retry_after: Duration::ZERO,
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");
    }

    #[test]
    fn test_unavailable_errors_are_retryable() {
        let exhausted = Error::PoolExhausted {
            waited: Duration::from_secs(3),
        };
        assert_eq!(exhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(exhausted.is_retryable());
        assert!(Error::Database(DbError::Unavailable("down".into())).is_retryable());
    }

    #[test]
    fn test_duplicate_username_message() {
        let err = Error::Database(DbError::duplicate_username("alice"));
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.code(), "conflict");
        assert_eq!(err.user_message(), "This username is already taken");
    }

    #[test]
    fn test_internal_details_not_leaked() {
        let err = Error::Internal {
            operation: "decrypt secret row 42".to_string(),
        };
        assert_eq!(err.user_message(), "Internal server error");
        assert_eq!(err.code(), "internal_error");
    }
}

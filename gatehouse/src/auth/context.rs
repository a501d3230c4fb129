//! Axum extractors for the caller's address and authenticated context.

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{header, request::Parts},
};
use std::{convert::Infallible, net::SocketAddr};
use tracing::{instrument, trace};

use crate::{
    AppState,
    auth::gateway::{AuthenticatedContext, bearer_token},
    db::pools::Connector,
    errors::{Error, Result},
};

/// Address the request is attributed to for rate limiting and lockout.
///
/// The first `X-Forwarded-For` entry is used only when `rate_limits.trust_forwarded_for` is set;
/// otherwise the peer address of the TCP connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddr(pub String);

impl ClientAddr {
    pub fn from_parts(parts: &Parts, trust_forwarded_for: bool) -> Self {
        if trust_forwarded_for
            && let Some(forwarded) = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|h| h.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        {
            return Self(forwarded.to_string());
        }

        match parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            Some(ConnectInfo(addr)) => Self(addr.ip().to_string()),
            None => Self("unknown".to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<C: Connector> FromRequestParts<AppState<C>> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &AppState<C>) -> std::result::Result<Self, Self::Rejection> {
        Ok(Self::from_parts(parts, state.config.rate_limits.trust_forwarded_for))
    }
}

impl<C: Connector> FromRequestParts<AppState<C>> for AuthenticatedContext<C> {
    type Rejection = Error;

    #[instrument(skip_all, err)]
    async fn from_request_parts(parts: &mut Parts, state: &AppState<C>) -> Result<Self> {
        let Some(auth_header) = parts.headers.get(header::AUTHORIZATION) else {
            trace!("No Authorization header");
            return Err(Error::Unauthenticated { message: None });
        };

        let auth_str = auth_header.to_str().map_err(|_| Error::InvalidToken)?;
        let token = bearer_token(auth_str).ok_or_else(|| Error::Unauthenticated {
            message: Some("Expected a Bearer token".to_string()),
        })?;

        state.gateway.authorize(token).await
    }
}

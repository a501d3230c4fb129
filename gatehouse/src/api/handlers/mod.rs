//! HTTP request handlers.
//!
//! Handlers are generic over the pool's [`Connector`](crate::db::pools::Connector) so the full
//! router runs in tests against fake connections. Authenticated handlers take an
//! [`AuthenticatedContext`](crate::auth::gateway::AuthenticatedContext), which verifies the
//! bearer token and leases a connection before the handler body runs.
//!
//! - [`auth`]: registration, login, refresh and logout
//! - [`config`]: non-secret configuration for clients
//! - [`users`]: the caller's identity and sessions, plus administrative user actions
//! - [`system`]: health check, pool status and lockout administration

pub mod auth;
pub mod config;
pub mod system;
pub mod users;

//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers
//! - **[`models`]**: Request/response data structures
//! - **[`middleware`]**: Rate-limit admission applied to every route
//!
//! # API Structure
//!
//! - **Authentication** (`/auth/register`, `/auth/login`, `/auth/refresh`, `/auth/logout`)
//! - **Caller** (`/auth/me`, `/auth/sessions`): require a bearer access token
//! - **Administration** (`/admin/*`): require an administrator's access token
//! - **Health** (`/healthz`): exempt from rate limiting
//!
//! API documentation is served at `/docs` when the server is running.

pub mod handlers;
pub mod middleware;
pub mod models;

//! Authentication and brute-force protection.
//!
//! # Modules
//!
//! - [`gateway`]: [`gateway::AuthGateway`], the facade handlers depend on
//! - [`tokens`]: access token signing/verification and refresh token rotation
//! - [`lockout`]: per-identity failure counting and temporary locks
//! - [`password`]: Argon2id hashing and refresh token material
//! - [`context`]: axum extractors for the caller's address and authenticated context
//!
//! # Token model
//!
//! Access tokens are short-lived HS256 JWTs checked without a store round trip. Refresh tokens
//! are opaque, stored only as digests, and rotate on every use. A rotated token presented again
//! revokes all of the user's sessions.
//!
//! # Login flow
//!
//! 1. The identity (`username@client_addr`) is checked for an active lock
//! 2. The password is verified off the async runtime (a dummy hash stands in for unknown users)
//! 3. The outcome is recorded, possibly locking the identity
//! 4. On success a token pair is issued

pub mod context;
pub mod gateway;
pub mod lockout;
pub mod password;
pub mod tokens;

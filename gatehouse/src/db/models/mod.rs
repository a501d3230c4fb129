//! Database record models matching table schemas.
//!
//! This module contains struct definitions that directly correspond to database
//! table rows. These models are used by repositories and by the in-memory store
//! to return query results and accept insertion data.
//!
//! - [`users`]: Accounts and their credential hashes
//! - [`refresh_tokens`]: Hashed refresh tokens and their revocation lineage
//! - [`login_attempts`]: Append-only log of login outcomes
//!
//! Database models are distinct from API models (see [`crate::api::models`]) so the
//! credential hash can never be serialized into a response by accident.

pub mod login_attempts;
pub mod refresh_tokens;
pub mod users;

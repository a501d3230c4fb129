//! API request and response data models.
//!
//! These structures define the public HTTP contract and are kept separate from the storage
//! models in [`crate::db::models`], so the two can evolve independently. Every model is
//! annotated with `utoipa` for the generated API docs.
//!
//! - [`auth`]: registration, login, refresh and logout payloads
//! - [`users`]: user profiles and active sessions
//! - [`system`]: health and administrative payloads

pub mod auth;
pub mod system;
pub mod users;

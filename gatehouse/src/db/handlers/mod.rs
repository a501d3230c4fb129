//! Repository implementations for database access.
//!
//! Each repository wraps a borrowed `PgConnection` (or a transaction deref'd to one) and exposes
//! strongly typed operations for a single table. Repositories are thin: they build queries,
//! bind parameters and map rows into [`crate::db::models`]. Business rules live in the services
//! that call them through [`crate::db::store::CredentialStore`].
//!
//! ```ignore
//! let mut conn = pool.acquire().await?;
//! let mut users = Users::new(&mut conn);
//! let user = users.get_by_username("alice").await?;
//! ```

pub mod login_attempts;
pub mod refresh_tokens;
pub mod users;

pub use login_attempts::LoginAttempts;
pub use refresh_tokens::RefreshTokens;
pub use users::Users;

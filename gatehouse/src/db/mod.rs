//! Persistence for credentials, and the connection pool business handlers run on.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ TokenService,    │
//! │ LockoutGuard ... │
//! └────────┬─────────┘
//!          │
//!          ↓
//! ┌──────────────────┐
//! │ CredentialStore  │  (db::store - the trait services depend on)
//! └───┬──────────┬───┘
//!     │          │
//!     ↓          ↓
//! ┌────────┐ ┌──────────────┐
//! │ memory │ │ Repositories │  (db::handlers - one per table)
//! └────────┘ └──────┬───────┘
//!                   │
//!                   ↓
//!            ┌─────────────┐
//!            │  PostgreSQL │
//!            └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: The [`store::CredentialStore`] trait and its Postgres implementation
//! - [`memory`]: In-process implementation for single-instance use and tests
//! - [`handlers`]: Table repositories used by the Postgres store
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//! - [`pools`]: The adaptive connection pool leased to authenticated handlers
//!
//! # Transactions
//!
//! Refresh token rotation runs in a single transaction: the old token is revoked with a
//! conditional update and the successor is inserted only if that update matched a row.
//!
//! # Migrations
//!
//! Migrations live in `migrations/` and are applied on startup through [`crate::migrator`]:
//!
//! ```ignore
//! gatehouse::migrator().run(&pool).await?;
//! ```

pub mod errors;
pub mod handlers;
pub mod memory;
pub mod models;
pub mod pools;
pub mod store;

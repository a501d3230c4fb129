use thiserror::Error;

/// Unique index enforcing case-insensitive usernames
pub const USERNAME_KEY: &str = "users_username_lower_key";
/// Unique constraint on stored refresh token digests
pub const TOKEN_HASH_KEY: &str = "refresh_tokens_token_hash_key";
/// Foreign key from a refresh token to its owner
pub const TOKEN_OWNER_FKEY: &str = "refresh_tokens_user_id_fkey";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Record not found")]
    NotFound,

    /// A unique key already holds this value
    #[error("Duplicate value for {constraint}")]
    Conflict {
        constraint: String,
        /// Offending value, when Postgres reports it
        value: Option<String>,
    },

    /// Row points at a record that does not exist
    #[error("Dangling reference ({constraint})")]
    InvalidReference { constraint: String },

    /// Row rejected by a CHECK constraint
    #[error("Row rejected by {constraint}")]
    Rejected { constraint: String },

    /// Connection refused, pool timed out, I/O failure
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DbError {
    pub fn duplicate_username(username: &str) -> Self {
        DbError::Conflict {
            constraint: USERNAME_KEY.to_string(),
            value: Some(username.to_string()),
        }
    }

    /// Whether this is a clash on the username index
    pub fn is_duplicate_username(&self) -> bool {
        matches!(self, DbError::Conflict { constraint, .. } if constraint == USERNAME_KEY)
    }
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        let db_err = match &err {
            sqlx::Error::RowNotFound => return DbError::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                return DbError::Unavailable(err.to_string());
            }
            sqlx::Error::Database(db_err) => db_err,
            _ => return DbError::Other(err.into()),
        };

        let constraint = db_err.constraint().unwrap_or("unknown").to_string();
        if db_err.is_unique_violation() {
            let value = db_err
                .try_downcast_ref::<sqlx::postgres::PgDatabaseError>()
                .and_then(|pg_err| pg_err.detail())
                .and_then(conflicting_value);
            DbError::Conflict { constraint, value }
        } else if db_err.is_foreign_key_violation() {
            DbError::InvalidReference { constraint }
        } else if db_err.is_check_violation() {
            DbError::Rejected { constraint }
        } else {
            DbError::Other(err.into())
        }
    }
}

/// Value out of a unique violation detail such as `Key (lower(username))=(alice) already exists.`
fn conflicting_value(detail: &str) -> Option<String> {
    let (_, rest) = detail.split_once(")=(")?;
    let (value, _) = rest.rsplit_once(") already exists")?;
    Some(value.to_string())
}

pub type Result<T> = std::result::Result<T, DbError>;

//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable overrides. The configuration
//! file path defaults to `config.yaml` but can be specified via `-f` flag or `GATEHOUSE_CONFIG`
//! environment variable.
//!
//! ## Loading Priority
//!
//! Configuration sources are merged in the following order (later sources override earlier ones):
//!
//! 1. **YAML config file** - Base configuration (default: `config.yaml`)
//! 2. **Environment variables** - Variables prefixed with `GATEHOUSE_` override YAML values
//! 3. **DATABASE_URL** / **REDIS_URL** - Special cases: override `database.url` and `counters.url`
//!
//! For nested config values, use double underscores in environment variables. For example,
//! `GATEHOUSE_AUTH__LOCKOUT__THRESHOLD=10` sets the `auth.lockout.threshold` field.
//!
//! The loaded [`Config`] is immutable: it is built once in `main` and passed by reference into
//! each component's constructor. Nothing in the crate reads configuration from ambient state.
//!
//! ## Environment Variable Examples
//!
//! ```bash
//! # Signing key for access tokens (required)
//! GATEHOUSE_SECRET_KEY="a-very-long-random-string-of-at-least-32-bytes"
//!
//! # Shorten access tokens to 10 minutes
//! GATEHOUSE_AUTH__TOKENS__ACCESS_TTL=10m
//!
//! # Shared counters in Redis
//! GATEHOUSE_COUNTERS__BACKEND=redis
//! REDIS_URL="redis://localhost:6379"
//!
//! # Per-class rate limit
//! GATEHOUSE_RATE_LIMITS__CLASSES__AUTHENTICATION__REQUESTS_PER_MINUTE=30
//! ```

use clap::Parser;
use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::errors::Error;
use crate::types::EndpointClass;

/// Simple CLI args - just for specifying config file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "GATEHOUSE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the server.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
///
/// All fields have sensible defaults defined in the `Default` implementation, except
/// `secret_key`, which must be supplied.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// HTTP server host to bind to (e.g., "0.0.0.0" for all interfaces)
    pub host: String,
    /// HTTP server port to bind to
    pub port: u16,
    /// Secret key material used to sign access tokens (HS256)
    pub secret_key: Option<String>,
    /// Username of the initial administrator (created or promoted on startup)
    pub admin_username: Option<String>,
    /// Password for the initial administrator; only used when the account is first created
    pub admin_password: Option<String>,
    /// Relational store connection settings
    pub database: DatabaseConfig,
    /// Shared counter store settings (rate limits and lockout counters)
    pub counters: CountersConfig,
    /// Credential, token and lockout settings
    pub auth: AuthConfig,
    /// Per-endpoint-class request budgets
    pub rate_limits: RateLimitConfig,
    /// Adaptive connection pool settings
    pub pool: PoolConfig,
    /// Enable OpenTelemetry OTLP export for distributed tracing
    pub enable_otel_export: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            secret_key: None,
            admin_username: None,
            admin_password: None,
            database: DatabaseConfig::default(),
            counters: CountersConfig::default(),
            auth: AuthConfig::default(),
            rate_limits: RateLimitConfig::default(),
            pool: PoolConfig::default(),
            enable_otel_export: false,
        }
    }
}

/// Relational store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Which credential store implementation to use
    pub backend: StoreBackend,
    /// PostgreSQL connection URL (used by the credential store and the connection pool)
    pub url: String,
    /// SQLx pool used internally by the Postgres credential store
    pub store_pool: PoolSettings,
    /// Run migrations on startup
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Postgres,
            url: "postgres://localhost:5432/gatehouse".to_string(),
            store_pool: PoolSettings::default(),
            run_migrations: true,
        }
    }
}

/// Backend selection for stores that have both an external and an in-process implementation.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; only suitable for a single instance and for tests
    Memory,
    Postgres,
    Redis,
}

/// SQLx pool parameters for the credential store's own pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSettings {
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Minimum number of idle connections to maintain
    pub min_connections: u32,
    /// Maximum time to wait for a connection
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 0,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CountersConfig {
    /// `memory` (single instance) or `redis` (shared across instances)
    pub backend: StoreBackend,
    /// Redis URL, required when `backend` is `redis`
    pub url: Option<String>,
    /// Namespace prefix for every key this service writes
    pub key_prefix: String,
    /// Upper bound on a single round trip to the store
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for CountersConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            key_prefix: "gatehouse:".to_string(),
            response_timeout: Duration::from_millis(500),
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthConfig {
    pub tokens: TokenConfig,
    pub password: PasswordConfig,
    pub lockout: LockoutConfig,
    /// Allow self-service registration through `POST /auth/register`
    pub allow_registration: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            tokens: TokenConfig::default(),
            password: PasswordConfig::default(),
            lockout: LockoutConfig::default(),
            allow_registration: true,
        }
    }
}

/// Access and refresh token lifetimes.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    /// `iss` claim written to and required on access tokens
    pub issuer: String,
    /// Access token validity window
    #[serde(with = "humantime_serde")]
    pub access_ttl: Duration,
    /// Refresh token validity window; must strictly exceed `access_ttl`
    #[serde(with = "humantime_serde")]
    pub refresh_ttl: Duration,
    /// Tolerance applied when checking expiry
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "gatehouse".to_string(),
            access_ttl: Duration::from_secs(15 * 60),
            refresh_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            clock_skew: Duration::from_secs(5),
        }
    }
}

/// Password policy and Argon2 parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PasswordConfig {
    pub min_length: usize,
    pub max_length: usize,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            min_length: 8,
            max_length: 128,
            argon2_memory_kib: 19456,
            argon2_iterations: 2,
            argon2_parallelism: 1,
        }
    }
}

/// Brute-force lockout policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LockoutConfig {
    /// Failures within `window` that trigger a lockout
    pub threshold: u32,
    /// Rolling window failures are counted in
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// How long an identity stays locked
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    /// How long login attempt rows are kept before the sweeper deletes them
    #[serde(with = "humantime_serde")]
    pub attempt_retention: Duration,
    /// How often the sweeper runs
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for LockoutConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(15 * 60),
            duration: Duration::from_secs(15 * 60),
            attempt_retention: Duration::from_secs(30 * 24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Budget for one endpoint class.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClassLimit {
    /// Steady-state rate, scaled to the configured counting window
    pub requests_per_minute: u32,
    /// Extra requests tolerated on top of the ceiling within one window
    pub burst: u32,
    /// Exempt classes are never counted
    pub exempt: bool,
}

impl Default for ClassLimit {
    fn default() -> Self {
        Self {
            requests_per_minute: 100,
            burst: 20,
            exempt: false,
        }
    }
}

impl ClassLimit {
    pub fn new(requests_per_minute: u32, burst: u32) -> Self {
        Self {
            requests_per_minute,
            burst,
            exempt: false,
        }
    }

    pub fn exempt() -> Self {
        Self {
            requests_per_minute: 0,
            burst: 0,
            exempt: true,
        }
    }

    /// Total accepted requests per counting window of length `window`
    pub fn ceiling(&self, window: Duration) -> u64 {
        let per_window = (u128::from(self.requests_per_minute) * window.as_millis()).div_ceil(60_000);
        u64::try_from(per_window)
            .unwrap_or(u64::MAX)
            .saturating_add(u64::from(self.burst))
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Disable rate limiting entirely
    pub enabled: bool,
    /// Allow requests through when the counter store is unreachable
    pub fail_open: bool,
    /// Use the first `X-Forwarded-For` entry as the client key
    pub trust_forwarded_for: bool,
    /// Length of one counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Budgets by class
    pub classes: HashMap<EndpointClass, ClassLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let classes = HashMap::from([
            (EndpointClass::Authentication, ClassLimit::new(20, 5)),
            (EndpointClass::Upload, ClassLimit::new(10, 5)),
            (EndpointClass::AiProcessing, ClassLimit::new(30, 10)),
            (EndpointClass::General, ClassLimit::new(100, 20)),
            (EndpointClass::HealthCheck, ClassLimit::exempt()),
            (EndpointClass::StaticAsset, ClassLimit::exempt()),
        ]);

        Self {
            enabled: true,
            fail_open: true,
            trust_forwarded_for: false,
            window: Duration::from_secs(60),
            classes,
        }
    }
}

impl RateLimitConfig {
    /// Budget for a class; unknown classes fall back to the `general` budget.
    pub fn limit_for(&self, class: EndpointClass) -> ClassLimit {
        self.classes
            .get(&class)
            .or_else(|| self.classes.get(&EndpointClass::General))
            .copied()
            .unwrap_or_default()
    }
}

/// Adaptive connection pool policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Lower bound on pool size
    pub floor: usize,
    /// Upper bound on pool size; keep below the database's own connection limit
    pub ceiling: usize,
    /// Fixed initial size. When unset, derived from available CPU parallelism
    pub initial_size: Option<usize>,
    /// Connections per available core used to derive the initial size
    pub connections_per_core: usize,
    /// Longest a caller waits in `lease()` before `PoolExhausted`
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// How often a metrics snapshot is taken
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    /// How often the sizing decision runs
    #[serde(with = "humantime_serde")]
    pub reassess_interval: Duration,
    /// Utilization above which the pool grows (0.0-1.0)
    pub high_watermark: f64,
    /// Utilization below which the pool shrinks (0.0-1.0)
    pub low_watermark: f64,
    /// Connections added or removed per decision
    pub step: usize,
    /// Connections older than this are retired
    #[serde(with = "humantime_serde")]
    pub max_lifetime: Duration,
    /// Idle connections unused for this long are recycled
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Number of snapshots kept in the in-memory time series
    pub metrics_retention: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            floor: 2,
            ceiling: 50,
            initial_size: None,
            connections_per_core: 2,
            acquire_timeout: Duration::from_secs(3),
            sample_interval: Duration::from_secs(10),
            reassess_interval: Duration::from_secs(120),
            high_watermark: 0.8,
            low_watermark: 0.3,
            step: 2,
            max_lifetime: Duration::from_secs(30 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            metrics_retention: 360,
        }
    }
}

impl PoolConfig {
    /// Initial pool size: explicit override, or a function of host core count, clamped to bounds.
    pub fn initial_size_for(&self, available_cores: usize) -> usize {
        let wanted = self
            .initial_size
            .unwrap_or_else(|| available_cores.max(1).saturating_mul(self.connections_per_core.max(1)));
        wanted.clamp(self.floor, self.ceiling)
    }
}

/// Non-secret operational parameters exposed to clients at `GET /auth/config`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PublicConfig {
    pub access_token_ttl_secs: u64,
    pub refresh_token_ttl_secs: u64,
    pub lockout_threshold: u32,
    pub lockout_duration_secs: u64,
    pub password_min_length: usize,
    pub password_max_length: usize,
    pub registration_enabled: bool,
    pub rate_limits: HashMap<EndpointClass, PublicClassLimit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PublicClassLimit {
    pub requests_per_minute: u32,
    pub burst: u32,
    pub exempt: bool,
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        let config: Self = Self::figment(args).extract()?;
        config.validate().map_err(|e| figment::Error::from(e.to_string()))?;
        Ok(config)
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            // Load base config file
            .merge(Yaml::file(&args.config))
            // Environment variables can still override specific values
            .merge(Env::prefixed("GATEHOUSE_").split("__"))
            // Common DATABASE_URL / REDIS_URL patterns
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .merge(Env::raw().only(&["REDIS_URL"]).map(|_| "counters.url".into()))
    }

    pub fn validate(&self) -> Result<(), Error> {
        let secret = self.secret_key.as_deref().unwrap_or_default();
        if secret.is_empty() {
            return Err(Error::Internal {
                operation: "Config validation: secret_key is not configured. \
                 Please set GATEHOUSE_SECRET_KEY environment variable or add secret_key to config file."
                    .to_string(),
            });
        }
        if secret.len() < 32 {
            return Err(Error::Internal {
                operation: "Config validation: secret_key must be at least 32 bytes".to_string(),
            });
        }

        let tokens = &self.auth.tokens;
        if tokens.access_ttl.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: auth.tokens.access_ttl must be positive".to_string(),
            });
        }
        if tokens.refresh_ttl <= tokens.access_ttl {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: auth.tokens.refresh_ttl ({:?}) must be longer than access_ttl ({:?})",
                    tokens.refresh_ttl, tokens.access_ttl
                ),
            });
        }
        if tokens.clock_skew > Duration::from_secs(60) {
            return Err(Error::Internal {
                operation: "Config validation: auth.tokens.clock_skew is too large (maximum 60s)".to_string(),
            });
        }

        let password = &self.auth.password;
        if password.min_length < 1 || password.min_length > password.max_length {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: Invalid password configuration: min_length ({}) must be between 1 and max_length ({})",
                    password.min_length, password.max_length
                ),
            });
        }

        let lockout = &self.auth.lockout;
        if lockout.threshold < 1 {
            return Err(Error::Internal {
                operation: "Config validation: auth.lockout.threshold must be at least 1".to_string(),
            });
        }
        if lockout.window.is_zero() || lockout.duration.is_zero() {
            return Err(Error::Internal {
                operation: "Config validation: auth.lockout.window and auth.lockout.duration must be positive".to_string(),
            });
        }

        if self.rate_limits.window.as_secs() < 1 {
            return Err(Error::Internal {
                operation: "Config validation: rate_limits.window must be at least one second".to_string(),
            });
        }

        let pool = &self.pool;
        if pool.floor > pool.ceiling || pool.ceiling == 0 {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: pool.floor ({}) cannot exceed pool.ceiling ({}), and the ceiling must be positive",
                    pool.floor, pool.ceiling
                ),
            });
        }
        if !(0.0 < pool.low_watermark && pool.low_watermark < pool.high_watermark && pool.high_watermark <= 1.0) {
            return Err(Error::Internal {
                operation: format!(
                    "Config validation: pool watermarks must satisfy 0 < low ({}) < high ({}) <= 1",
                    pool.low_watermark, pool.high_watermark
                ),
            });
        }
        if pool.step == 0 {
            return Err(Error::Internal {
                operation: "Config validation: pool.step must be at least 1".to_string(),
            });
        }
        if pool.sample_interval.is_zero() || pool.reassess_interval < pool.sample_interval {
            return Err(Error::Internal {
                operation: "Config validation: pool.reassess_interval must be at least one pool.sample_interval".to_string(),
            });
        }

        if self.counters.backend == StoreBackend::Redis && self.counters.url.is_none() {
            return Err(Error::Internal {
                operation: "Config validation: counters.backend is redis but no counters.url / REDIS_URL is set".to_string(),
            });
        }
        if self.counters.backend == StoreBackend::Postgres {
            return Err(Error::Internal {
                operation: "Config validation: counters.backend must be memory or redis".to_string(),
            });
        }
        if self.database.backend == StoreBackend::Redis {
            return Err(Error::Internal {
                operation: "Config validation: database.backend must be memory or postgres".to_string(),
            });
        }

        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parameters safe to hand to clients.
    pub fn public(&self) -> PublicConfig {
        PublicConfig {
            access_token_ttl_secs: self.auth.tokens.access_ttl.as_secs(),
            refresh_token_ttl_secs: self.auth.tokens.refresh_ttl.as_secs(),
            lockout_threshold: self.auth.lockout.threshold,
            lockout_duration_secs: self.auth.lockout.duration.as_secs(),
            password_min_length: self.auth.password.min_length,
            password_max_length: self.auth.password.max_length,
            registration_enabled: self.auth.allow_registration,
            rate_limits: EndpointClass::ALL
                .iter()
                .map(|class| {
                    let limit = self.rate_limits.limit_for(*class);
                    (
                        *class,
                        PublicClassLimit {
                            requests_per_minute: limit.requests_per_minute,
                            burst: limit.burst,
                            exempt: limit.exempt,
                        },
                    )
                })
                .collect(),
        }
    }
}

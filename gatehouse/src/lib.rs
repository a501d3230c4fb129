//! # gatehouse: Authentication and Resource Governance
//!
//! `gatehouse` sits in front of business handlers and decides, for every inbound request, whether
//! it may proceed and on which database connection. It issues and rotates credentials, throttles
//! password guessing, enforces per-client request budgets, and leases connections from a pool
//! that sizes itself from observed load.
//!
//! ## Architecture
//!
//! The HTTP layer is built on [Axum](https://github.com/tokio-rs/axum). Users, refresh tokens and
//! the login attempt log live in PostgreSQL (or an in-process store for single-instance use and
//! tests). Lockout and rate-limit counters live in a shared counter store, Redis in production,
//! so every instance sees the same numbers.
//!
//! ### Request Flow
//!
//! 1. The [`api::middleware::rate_limit`] layer classifies the path into an
//!    [`types::EndpointClass`] and charges the request against the client's budget. Over-budget
//!    requests get a 429 with `Retry-After` before any handler runs.
//! 2. Handlers that need a caller take an [`auth::gateway::AuthenticatedContext`]. Extracting it
//!    verifies the bearer access token and leases a connection from the pool; the connection
//!    goes back when the context is dropped.
//! 3. Login goes through the [`auth::lockout::LockoutGuard`] before any password is checked, and
//!    records the outcome afterwards.
//!
//! ### Core Components
//!
//! - [`auth::tokens::TokenService`]: access token signing and validation, refresh token rotation
//!   with reuse detection.
//! - [`auth::lockout::LockoutGuard`]: failed-attempt counting and temporary lockout.
//! - [`limits::RateLimiter`]: sliding-window request budgets per endpoint class.
//! - [`db::pools::ConnectionPoolManager`]: bounded connection leasing with adaptive sizing.
//! - [`auth::gateway::AuthGateway`]: composes the above into the single entry point handlers use.
//! - [`db::store::CredentialStore`]: persistence for users, refresh tokens and login attempts.
//!
//! **Background services** run alongside the HTTP server: pool maintenance (sampling, idle
//! recycling, resizing) and a sweeper that deletes expired refresh tokens and old login attempts.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use gatehouse::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = gatehouse::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     gatehouse::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.

pub mod api;
pub mod auth;
pub mod config;
pub mod counters;
pub mod db;
pub mod errors;
pub mod limits;
mod openapi;
pub mod telemetry;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use axum::{
    Router,
    middleware::from_fn_with_state,
    routing::{get, post},
};
use bon::Builder;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, debug, info, warn};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;
pub use types::UserId;

use crate::{
    api::handlers::{auth as auth_handlers, config as config_handlers, system, users},
    auth::gateway::AuthGateway,
    config::StoreBackend,
    counters::CounterStore,
    db::{
        memory::MemoryCredentialStore,
        pools::{ConnectionPoolManager, Connector, PgConnectionPool, PgConnector, run_pool_maintenance},
        store::{CredentialStore, PgCredentialStore},
    },
    openapi::ApiDoc,
};

/// Application state shared across all request handlers.
///
/// Generic over the pool's [`Connector`] so the full router can run against a fake connector in
/// tests.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(Arc::new(config))
///     .gateway(Arc::new(gateway))
///     .build();
/// ```
#[derive(Builder)]
pub struct AppState<C: Connector> {
    pub config: Arc<Config>,
    pub gateway: Arc<AuthGateway<C>>,
}

impl<C: Connector> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            gateway: self.gateway.clone(),
        }
    }
}

/// Get the gatehouse database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Build the HTTP router: API routes, interactive docs at `/docs`, rate limiting and tracing.
pub fn build_router<C: Connector>(state: AppState<C>) -> Router {
    let routes = Router::new()
        .route("/auth/register", post(auth_handlers::register::<C>))
        .route("/auth/login", post(auth_handlers::login::<C>))
        .route("/auth/refresh", post(auth_handlers::refresh::<C>))
        .route("/auth/logout", post(auth_handlers::logout::<C>))
        .route("/auth/config", get(config_handlers::get_config::<C>))
        .route("/auth/me", get(users::get_me::<C>))
        .route("/auth/sessions", get(users::list_sessions::<C>))
        .route("/healthz", get(system::healthz::<C>))
        .route("/admin/pool", get(system::pool_status::<C>))
        .route(
            "/admin/lockout",
            get(system::lockout_status::<C>).delete(system::unlock::<C>),
        )
        .route("/admin/users/{user_id}/disable", post(users::disable_user::<C>))
        .route("/admin/users/{user_id}/enable", post(users::enable_user::<C>))
        .with_state(state.clone());

    Router::new()
        .merge(routes)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()))
        .layer(from_fn_with_state(state, api::middleware::rate_limit::<C>))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
}

/// Delete refresh tokens past their expiry and login attempts older than `attempt_retention`.
///
/// Returns `(tokens, attempts)` deleted.
pub async fn sweep_credentials(store: &dyn CredentialStore, attempt_retention: Duration) -> anyhow::Result<(u64, u64)> {
    let now = Utc::now();
    let cutoff = now - chrono::Duration::from_std(attempt_retention)?;
    let tokens = store.purge_expired_refresh_tokens(now).await?;
    let attempts = store.purge_login_attempts(cutoff).await?;
    Ok((tokens, attempts))
}

async fn run_sweeper(
    store: Arc<dyn CredentialStore>,
    interval: Duration,
    attempt_retention: Duration,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Starting credential sweeper with {:?} interval", interval);
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Credential sweeper shutting down");
                break;
            }
            _ = tick.tick() => {
                match sweep_credentials(store.as_ref(), attempt_retention).await {
                    Ok((0, 0)) => {}
                    Ok((tokens, attempts)) => info!(tokens, attempts, "Swept expired credentials"),
                    Err(e) => warn!("Credential sweep failed: {:#}", e),
                }
            }
        }
    }

    Ok(())
}

async fn run_counter_purge(counters: Arc<dyn CounterStore>, interval: Duration, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                match counters.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => debug!(purged, "Purged expired counters"),
                    Err(e) => warn!("Counter purge failed: {}", e),
                }
            }
        }
    }
}

/// Background tasks that run alongside the HTTP server.
///
/// - Pool maintenance: metrics sampling, idle recycling, adaptive resizing
/// - Credential sweeper: expired refresh tokens and old login attempts
/// - Counter purge: expired rate-limit windows and lockout logs, once per rate-limit window
///
/// Dropping the struct cancels the shutdown token; [`shutdown`](BackgroundServices::shutdown)
/// also waits for the tasks to finish.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    _drop_guard: tokio_util::sync::DropGuard,
}

impl BackgroundServices {
    pub fn start<C: Connector>(
        pool: ConnectionPoolManager<C>,
        store: Arc<dyn CredentialStore>,
        counters: Arc<dyn CounterStore>,
        config: &Config,
    ) -> Self {
        let shutdown_token = CancellationToken::new();
        let mut background_tasks = Vec::new();

        let token = shutdown_token.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = run_pool_maintenance(pool, token).await {
                tracing::error!("Pool maintenance stopped: {:#}", e);
            }
        }));

        let token = shutdown_token.clone();
        let lockout = config.auth.lockout.clone();
        background_tasks.push(tokio::spawn(async move {
            if let Err(e) = run_sweeper(store, lockout.sweep_interval, lockout.attempt_retention, token).await {
                tracing::error!("Credential sweeper stopped: {:#}", e);
            }
        }));

        let token = shutdown_token.clone();
        let interval = config.rate_limits.window;
        background_tasks.push(tokio::spawn(run_counter_purge(counters, interval, token)));

        Self {
            background_tasks,
            _drop_guard: shutdown_token.clone().drop_guard(),
            shutdown_token,
        }
    }

    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

/// Connect the configured credential store, running migrations for Postgres when enabled.
async fn setup_store(config: &Config) -> anyhow::Result<(Arc<dyn CredentialStore>, Option<PgCredentialStore>)> {
    match config.database.backend {
        StoreBackend::Memory => {
            warn!("Using in-process credential store; users and sessions are lost on restart");
            Ok((Arc::new(MemoryCredentialStore::new()), None))
        }
        _ => {
            let store = PgCredentialStore::connect(&config.database).await?;
            if config.database.run_migrations {
                info!("Running database migrations...");
                migrator().run(store.pool()).await?;
            }
            Ok((Arc::new(store.clone()), Some(store)))
        }
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] connects the stores, runs migrations, bootstraps the
///    administrator, and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown signal fires, stops background services and closes pools
pub struct Application {
    router: Router,
    config: Config,
    pool: PgConnectionPool,
    pg_store: Option<PgCredentialStore>,
    bg_services: BackgroundServices,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting gatehouse with configuration: {:#?}", config.public());

        let (store, pg_store) = setup_store(&config).await?;
        let counters = counters::connect(&config.counters).await?;
        let pool = ConnectionPoolManager::new(PgConnector::new(&config.database.url)?, &config.pool);
        let gateway = AuthGateway::new(&config, store.clone(), counters.clone(), pool.clone())?;

        if let Some(username) = config.admin_username.as_deref() {
            let admin = gateway.ensure_admin(username, config.admin_password.as_deref()).await?;
            info!(user_id = %types::abbrev_uuid(&admin.id), "Administrator account ready");
        }

        let bg_services = BackgroundServices::start(pool.clone(), store, counters, &config);

        let state = AppState::builder()
            .config(Arc::new(config.clone()))
            .gateway(Arc::new(gateway))
            .build();
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            pool,
            pg_store,
            bg_services,
        })
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("Gatehouse listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;
        if let Some(store) = self.pg_store {
            store.pool().close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        api::models::auth::LoginResponse,
        auth::{lockout::LockoutStatus, tokens::TokenPair},
        db::{
            models::{
                login_attempts::{AttemptOutcome, LoginAttemptCreateDBRequest},
                users::UserCreateDBRequest,
            },
            pools::SizingDecision,
        },
        counters::MemoryCounterStore,
        test_utils::{create_test_app, create_test_config, login_user, register_user},
        config::ClassLimit,
        errors::Error,
        types::{EndpointClass, IdentityKey, Role},
    };
    use axum::http::StatusCode;
    use serde_json::{Value, json};
    use std::future::IntoFuture;

    /// Client address seen by handlers when requests come from the in-process test transport
    const TEST_CLIENT: &str = "unknown";

    #[tokio::test]
    async fn test_repeated_successful_logins_leave_lockout_clear() {
        let (server, state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        let identity = IdentityKey::new("alice", TEST_CLIENT);

        for _ in 0..3 {
            login_user(&server, "alice", "correct-horse-battery").await;
            assert_eq!(state.gateway.lockout().status(&identity).await.unwrap(), LockoutStatus::Clear);
        }
    }

    #[tokio::test]
    async fn test_lockout_after_threshold_does_not_affect_other_users() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        register_user(&server, "bob", "battery-staple-horse").await;

        for _ in 0..5 {
            server
                .post("/auth/login")
                .json(&json!({"username": "alice", "password": "wrong-password"}))
                .await
                .assert_status(StatusCode::UNAUTHORIZED);
        }

        let alice = server
            .post("/auth/login")
            .json(&json!({"username": "alice", "password": "correct-horse-battery"}));
        let bob = server
            .post("/auth/login")
            .json(&json!({"username": "bob", "password": "battery-staple-horse"}));
        let (alice, bob) = tokio::join!(alice.into_future(), bob.into_future());

        alice.assert_status(StatusCode::LOCKED);
        let retry_after: u64 = alice
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap();
        assert!(retry_after > 0);
        let body: Value = alice.json();
        assert_eq!(body["error"], "locked");

        bob.assert_status(StatusCode::OK);
        let body: LoginResponse = bob.json();
        assert_eq!(body.user.username, "bob");
    }

    #[tokio::test]
    async fn test_replayed_refresh_token_revokes_every_session() {
        let (server, _state) = create_test_app(create_test_config());
        register_user(&server, "alice", "correct-horse-battery").await;
        let laptop = login_user(&server, "alice", "correct-horse-battery").await;
        let phone = login_user(&server, "alice", "correct-horse-battery").await;

        let response = server
            .post("/auth/refresh")
            .json(&json!({"refresh_token": laptop.refresh_token}))
            .await;
        response.assert_status(StatusCode::OK);
        let rotated: TokenPair = response.json();

        let response = server
            .post("/auth/refresh")
            .json(&json!({"refresh_token": laptop.refresh_token}))
            .await;
        response.assert_status(StatusCode::UNAUTHORIZED);
        let body: Value = response.json();
        assert_eq!(body["error"], "reuse_detected");

        for token in [&rotated.refresh_token, &phone.refresh_token] {
            let response = server.post("/auth/refresh").json(&json!({"refresh_token": token})).await;
            response.assert_status(StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_budget_exhausted_within_window() {
        let (_server, state) = create_test_app(create_test_config());
        let limiter = state.gateway.limiter();
        // Start of a 60s window
        let now_ms = 1_700_000_040_000;

        // General class: 100 per minute plus a burst of 20
        for i in 0..120 {
            let decision = limiter.allow_at(TEST_CLIENT, EndpointClass::General, now_ms + i).await;
            assert!(decision.is_ok(), "request {} should be admitted", i + 1);
        }
        assert!(matches!(
            limiter.allow_at(TEST_CLIENT, EndpointClass::General, now_ms + 500).await,
            Err(Error::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn test_rate_limited_response() {
        let mut config = create_test_config();
        // A day-long window keeps the whole test inside one window
        config.rate_limits.window = Duration::from_secs(24 * 60 * 60);
        config.rate_limits.classes.insert(EndpointClass::General, ClassLimit::new(0, 3));
        let (server, _state) = create_test_app(config);

        for _ in 0..3 {
            server.get("/auth/config").await.assert_status_ok();
        }

        let response = server.get("/auth/config").await;
        response.assert_status(StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get("retry-after").is_some());
        let body: Value = response.json();
        assert_eq!(body["error"], "rate_limited");

        // Health checks are never counted
        server.get("/healthz").await.assert_status(StatusCode::OK);
    }

    #[tokio::test]
    async fn test_pool_grows_under_load_and_shrinks_after() {
        let (_server, state) = create_test_app(create_test_config());
        let pool = state.gateway.pool();
        assert_eq!(pool.size(), 4);

        let leases = futures::future::join_all((0..4).map(|_| pool.lease())).await;
        assert!(leases.iter().all(|l| l.is_ok()));
        for _ in 0..3 {
            pool.sample();
        }
        assert_eq!(pool.reassess_now(), SizingDecision::Grow { from: 4, to: 6 });

        drop(leases);
        for _ in 0..3 {
            pool.sample();
        }
        assert_eq!(pool.reassess_now(), SizingDecision::Shrink { from: 6, to: 4 });
    }

    #[tokio::test]
    async fn test_docs_served() {
        let (server, _state) = create_test_app(create_test_config());
        server.get("/docs").await.assert_status_ok();
    }

    #[tokio::test]
    async fn test_sweep_credentials() {
        let store = MemoryCredentialStore::new();
        let user = store
            .create_user(&UserCreateDBRequest {
                username: "alice".to_string(),
                password_hash: "hash".to_string(),
                role: Role::User,
            })
            .await
            .unwrap();

        let old = LoginAttemptCreateDBRequest {
            identity_key: "alice@10.0.0.1".to_string(),
            user_id: Some(user.id),
            outcome: AttemptOutcome::Failure,
            attempted_at: Utc::now() - chrono::Duration::days(40),
        };
        store.record_login_attempt(&old).await.unwrap();
        store
            .record_login_attempt(&LoginAttemptCreateDBRequest {
                attempted_at: Utc::now(),
                ..old.clone()
            })
            .await
            .unwrap();

        let (tokens, attempts) = sweep_credentials(&store, Duration::from_secs(30 * 24 * 60 * 60)).await.unwrap();
        assert_eq!(tokens, 0);
        assert_eq!(attempts, 1);
        assert_eq!(store.recent_login_attempts("alice@10.0.0.1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_services_shutdown() {
        let config = create_test_config();
        let pool = ConnectionPoolManager::new(crate::test_utils::FakeConnector::default(), &config.pool);
        let services = BackgroundServices::start(
            pool.clone(),
            Arc::new(MemoryCredentialStore::new()),
            Arc::new(MemoryCounterStore::new()),
            &config,
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(!pool.history().is_empty());

        services.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_services_purge_expired_counters() {
        let mut config = create_test_config();
        config.rate_limits.window = Duration::from_secs(10);
        let pool = ConnectionPoolManager::new(crate::test_utils::FakeConnector::default(), &config.pool);
        let counters = Arc::new(MemoryCounterStore::new());
        for window in 0..100 {
            counters
                .incr(&format!("rl:api:10.0.0.1:{window}"), 1, Duration::from_secs(5))
                .await
                .unwrap();
        }

        let services = BackgroundServices::start(
            pool,
            Arc::new(MemoryCredentialStore::new()),
            counters.clone(),
            &config,
        );
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(counters.is_empty());

        services.shutdown().await;
    }
}

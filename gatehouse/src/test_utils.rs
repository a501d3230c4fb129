//! Test utilities for integration testing (available with `test-utils` feature).

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::{
    AppState,
    api::models::{auth::LoginResponse, users::UserResponse},
    auth::{gateway::AuthGateway, tokens::TokenPair},
    config::{Config, PasswordConfig, PoolConfig, StoreBackend},
    counters::{CounterError, CounterStore, MemoryCounterStore},
    db::{
        memory::MemoryCredentialStore,
        pools::{ConnectionPoolManager, Connector},
    },
};

pub const ADMIN_USERNAME: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-password-for-tests";

/// Connection handed out by [`FakeConnector`]
#[derive(Debug)]
pub struct FakeConnection {
    pub id: usize,
}

/// In-process connector that counts opens and closes and can be told to misbehave.
#[derive(Debug, Default)]
pub struct FakeConnector {
    opened: AtomicUsize,
    closed: AtomicUsize,
    unhealthy: AtomicBool,
    fail_connect: AtomicBool,
    connect_delay_ms: AtomicU64,
}

impl FakeConnector {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Health probes on existing connections return `healthy`
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make every new connection take `delay` to open
    pub fn set_connect_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.connect_delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Connection = FakeConnection;

    async fn connect(&self) -> anyhow::Result<FakeConnection> {
        let delay = self.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeConnection { id })
    }

    async fn is_healthy(&self, _conn: &mut FakeConnection) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    async fn close(&self, _conn: FakeConnection) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Counter store whose backend is permanently down.
pub struct FailingCounterStore;

#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn incr(&self, _key: &str, _delta: i64, _ttl: Duration) -> crate::counters::Result<i64> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn get(&self, _key: &str) -> crate::counters::Result<Option<i64>> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn set(&self, _key: &str, _value: i64, _ttl: Duration) -> crate::counters::Result<()> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn delete(&self, _key: &str) -> crate::counters::Result<()> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn ttl(&self, _key: &str) -> crate::counters::Result<Option<Duration>> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn ping(&self) -> crate::counters::Result<()> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn record_event(&self, _key: &str, _window: Duration) -> crate::counters::Result<u64> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }

    async fn count_events(&self, _key: &str, _window: Duration) -> crate::counters::Result<u64> {
        Err(CounterError::Unavailable("connection refused".to_string()))
    }
}

pub fn create_test_config() -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: Some("test-secret-key-for-gatehouse-unit-tests-0123".to_string()),
        pool: PoolConfig {
            floor: 1,
            ceiling: 8,
            initial_size: Some(4),
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    };
    config.database.backend = StoreBackend::Memory;
    config.database.run_migrations = false;
    config.counters.backend = StoreBackend::Memory;
    // Cheap hashing keeps the suite fast
    config.auth.password = PasswordConfig {
        argon2_memory_kib: 1024,
        argon2_iterations: 1,
        argon2_parallelism: 1,
        ..Default::default()
    };
    config
}

/// Gateway over in-memory stores and a [`FakeConnector`] pool.
pub fn create_test_gateway(config: Config) -> AuthGateway<FakeConnector> {
    let pool = ConnectionPoolManager::new(FakeConnector::default(), &config.pool);
    AuthGateway::new(
        &config,
        Arc::new(MemoryCredentialStore::new()),
        Arc::new(MemoryCounterStore::new()),
        pool,
    )
    .expect("Failed to create test gateway")
}

pub fn create_test_app(config: Config) -> (TestServer, AppState<FakeConnector>) {
    let gateway = create_test_gateway(config.clone());
    let state = AppState::builder()
        .config(Arc::new(config))
        .gateway(Arc::new(gateway))
        .build();
    let router = crate::build_router(state.clone());
    let server = TestServer::new(router).expect("Failed to create test server");
    (server, state)
}

pub async fn register_user(server: &TestServer, username: &str, password: &str) -> UserResponse {
    let response = server
        .post("/auth/register")
        .json(&json!({"username": username, "password": password}))
        .await;
    response.assert_status(axum::http::StatusCode::CREATED);
    response.json()
}

pub async fn login_user(server: &TestServer, username: &str, password: &str) -> TokenPair {
    let response = server
        .post("/auth/login")
        .json(&json!({"username": username, "password": password}))
        .await;
    response.assert_status_ok();
    response.json::<LoginResponse>().tokens
}

/// Bootstrap the administrator account and log in as it.
pub async fn login_admin(server: &TestServer, state: &AppState<FakeConnector>) -> TokenPair {
    state
        .gateway
        .ensure_admin(ADMIN_USERNAME, Some(ADMIN_PASSWORD))
        .await
        .expect("Failed to create admin user");
    login_user(server, ADMIN_USERNAME, ADMIN_PASSWORD).await
}

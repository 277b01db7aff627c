//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use wharf::Wharf;
use wharf::config::WharfConfig;
use wharf::container::{Container, ContainerStatus, CreateContainerRequest, SqliteContainerStore};
use wharf::db::Database;
use wharf::permissions::{Role, RoleGate};
use wharf::resources::{PortDeclaration, ResourceRequest};
use wharf::runtime::FakeRuntime;

pub const ALICE: &str = "alice";
pub const BOB: &str = "bob";
pub const ADMIN: &str = "admin";

/// Each environment gets its own slice of host ports so tests running in
/// parallel never compete for the same listeners.
static NEXT_PORT_BLOCK: AtomicU16 = AtomicU16::new(0);
const PORT_BLOCK_SIZE: u16 = 20;

pub struct TestEnv {
    pub runtime: Arc<FakeRuntime>,
    pub store: Arc<SqliteContainerStore>,
    pub db: Database,
    pub wharf: Wharf,
    pub config: WharfConfig,
}

/// Config suited to tests: fast retries, short timeouts, a private port
/// range.
pub fn test_config() -> WharfConfig {
    let block = NEXT_PORT_BLOCK.fetch_add(1, Ordering::SeqCst);
    let start = 21000 + block * PORT_BLOCK_SIZE;

    let mut config = WharfConfig::default();
    config.runtime.call_timeout_secs = 2;
    config.runtime.retry_base_delay_ms = 1;
    config.ports.range_start = start;
    config.ports.range_end = start + PORT_BLOCK_SIZE - 1;
    config.ports.connect_timeout_secs = 1;
    config.terminal.default_session_limit = 4;
    config
}

pub fn test_gate() -> RoleGate {
    RoleGate::new(Role::User).with_role(ADMIN, Role::Admin)
}

pub async fn test_env() -> TestEnv {
    test_env_with(test_config()).await
}

pub async fn test_env_with(config: WharfConfig) -> TestEnv {
    let runtime = Arc::new(FakeRuntime::new());
    let db = Database::in_memory().await.expect("in-memory database");
    let store = Arc::new(SqliteContainerStore::new(db.pool().clone()));
    let wharf = Wharf::new(
        runtime.clone(),
        store.clone(),
        Arc::new(test_gate()),
        &config,
    )
    .expect("assemble managers");
    TestEnv {
        runtime,
        store,
        db,
        wharf,
        config,
    }
}

/// A valid create request with no declared ports.
pub fn create_request(name: &str) -> CreateContainerRequest {
    CreateContainerRequest::new(
        name,
        "docker.io/library/alpine:3.20",
        ResourceRequest {
            cpus: 1.0,
            memory: "512m".to_string(),
            ports: Vec::new(),
        },
    )
}

/// A valid create request declaring the given TCP ports.
pub fn create_request_with_ports(name: &str, ports: &[u32]) -> CreateContainerRequest {
    let mut request = create_request(name);
    request.resources.ports = ports.iter().copied().map(PortDeclaration::tcp).collect();
    request
}

impl TestEnv {
    /// Create a running container owned by `user`.
    pub async fn running_container(&self, user: &str, name: &str) -> Container {
        let container = self
            .wharf
            .containers
            .create(user, create_request(name))
            .await
            .expect("create container");
        assert_eq!(container.status, ContainerStatus::Running);
        container
    }

    pub fn status(&self, id: &str) -> Option<ContainerStatus> {
        self.wharf.containers.registry().status(id)
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

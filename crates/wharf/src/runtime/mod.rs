//! Container runtime client.
//!
//! [`ContainerRuntimeApi`] is the narrow seam between the managers and the
//! container daemon. [`ContainerRuntime`] implements it on top of the Docker
//! or Podman CLI; [`FakeRuntime`] is an in-memory double with injectable
//! failures used by the test suites.

mod cli;
mod error;
mod events;
pub mod fake;
mod pty;

pub use cli::{ContainerRuntime, RuntimeType};
pub use error::{RuntimeError, RuntimeResult};
pub use events::{DaemonAction, DaemonEvent};
pub use fake::FakeRuntime;

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

/// Label carrying the owning user id on every managed container.
pub const OWNER_LABEL: &str = "wharf.owner";

/// Label marking containers managed by this service.
pub const MANAGED_LABEL: &str = "wharf.managed";

/// Label carrying the id of the create request that made the container.
pub const REQUEST_LABEL: &str = "wharf.request";

/// What the daemon needs to create a container.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    /// CPU limit in thousandths of a CPU.
    pub cpu_millis: u32,
    pub memory_bytes: u64,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
}

/// Daemon-side container state (as reported by `inspect`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::str::FromStr for DaemonState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "created" | "configured" | "initialized" => DaemonState::Created,
            "running" => DaemonState::Running,
            "paused" => DaemonState::Paused,
            "restarting" => DaemonState::Restarting,
            "removing" => DaemonState::Removing,
            "exited" | "stopped" => DaemonState::Exited,
            "dead" => DaemonState::Dead,
            _ => DaemonState::Unknown,
        })
    }
}

/// Result of inspecting a container.
#[derive(Debug, Clone)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub state: DaemonState,
    /// First address found on the container's networks.
    pub ip_address: Option<IpAddr>,
    pub labels: HashMap<String, String>,
}

/// Terminal window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 40, cols: 120 }
    }
}

/// An interactive process to run inside a container under a PTY.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub size: TerminalSize,
}

/// Out-of-band control over a spawned PTY process.
pub trait PtyControl: Send + Sync {
    fn resize(&self, size: TerminalSize) -> RuntimeResult<()>;

    /// Terminate the process. Calling it on an exited process is not an error.
    fn kill(&self) -> RuntimeResult<()>;
}

/// A live PTY process attached to a container.
///
/// `output` closes when the process side of the PTY is gone; `exit`
/// resolves with the exit code (if known) once the process is reaped.
pub struct PtyProcess {
    pub input: mpsc::Sender<Bytes>,
    pub output: mpsc::Receiver<Bytes>,
    pub exit: oneshot::Receiver<Option<i32>>,
    pub control: Box<dyn PtyControl>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").finish_non_exhaustive()
    }
}

/// Stream of daemon events.
pub type EventStream = BoxStream<'static, RuntimeResult<DaemonEvent>>;

/// Container runtime abstraction for testability.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// Create (but do not start) a container, returning its id.
    async fn create_container(&self, spec: &CreateSpec) -> RuntimeResult<String>;
    async fn start_container(&self, container_id: &str) -> RuntimeResult<()>;
    async fn stop_container(
        &self,
        container_id: &str,
        timeout_seconds: Option<u32>,
    ) -> RuntimeResult<()>;
    async fn remove_container(&self, container_id: &str, force: bool) -> RuntimeResult<()>;

    /// Returns `Ok(None)` when the container does not exist.
    async fn inspect_container(
        &self,
        container_id: &str,
    ) -> RuntimeResult<Option<ContainerInspect>>;

    /// Spawn an interactive process inside the container under a PTY.
    async fn exec_attach(
        &self,
        container_id: &str,
        request: &ExecRequest,
    ) -> RuntimeResult<PtyProcess>;

    /// Subscribe to container events. The stream ends when the daemon
    /// connection drops.
    async fn subscribe_events(&self) -> RuntimeResult<EventStream>;
}

//! Wiring of the managers around one shared registry.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WharfConfig;
use crate::container::{ContainerManager, ContainerRegistry, ContainerStore, RestoreReport};
use crate::error::WharfResult;
use crate::permissions::PermissionGate;
use crate::ports::PortForwardingManager;
use crate::retry::DaemonPolicy;
use crate::runtime::ContainerRuntimeApi;
use crate::terminal::{TerminalOptions, TerminalSessionManager};

/// The assembled service: containers, terminals and port forwards over one
/// runtime, store and permission gate.
#[derive(Clone)]
pub struct Wharf {
    pub containers: Arc<ContainerManager>,
    pub terminals: TerminalSessionManager,
    pub ports: Arc<PortForwardingManager>,
    idle_check_interval: Duration,
}

impl Wharf {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        store: Arc<dyn ContainerStore>,
        gate: Arc<dyn PermissionGate>,
        config: &WharfConfig,
    ) -> WharfResult<Self> {
        let policy = DaemonPolicy::from(&config.runtime);
        let registry = Arc::new(ContainerRegistry::new());

        let ports = Arc::new(PortForwardingManager::new(
            Arc::clone(&runtime),
            policy,
            Arc::clone(&store),
            &config.ports,
        )?);
        let terminals = TerminalSessionManager::new(
            Arc::clone(&runtime),
            policy,
            Arc::clone(&registry),
            Arc::clone(&gate),
            TerminalOptions::from_settings(&config.runtime, &config.terminal),
        )?;
        let containers = Arc::new(ContainerManager::new(
            runtime,
            policy,
            store,
            registry,
            gate,
            terminals.clone(),
            Arc::clone(&ports),
            config.runtime.stop_timeout_secs,
        ));

        Ok(Self {
            containers,
            terminals,
            ports,
            idle_check_interval: Duration::from_secs(
                config.terminal.idle_check_interval_secs.max(1),
            ),
        })
    }

    /// Restore persisted state, then start reconciliation and the idle
    /// sweep. Background tasks end when `cancel` fires.
    pub async fn start(
        &self,
        cancel: CancellationToken,
    ) -> WharfResult<(RestoreReport, Vec<JoinHandle<()>>)> {
        let report = self.containers.restore().await?;
        let mut tasks = vec![self.containers.spawn_reconciler(cancel.clone())];
        if let Some(sweeper) = self
            .terminals
            .start_idle_sweeper(self.idle_check_interval, cancel)
        {
            tasks.push(sweeper);
        }
        Ok((report, tasks))
    }

    /// Close every terminal session and port relay. Containers keep
    /// running; their forwards are restored on the next start.
    pub async fn shutdown(&self) {
        let sessions = self.terminals.shutdown();
        let forwards = self.ports.active_count();
        self.ports.shutdown().await;
        info!(
            "shut down: closed {} terminal session(s) and {} port relay(s)",
            sessions, forwards
        );
    }
}

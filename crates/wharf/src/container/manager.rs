//! Container lifecycle management.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::models::{Container, ContainerStatus, CreateContainerRequest};
use super::registry::ContainerRegistry;
use super::repository::ContainerStore;
use crate::error::{Violations, WharfError, WharfResult};
use crate::permissions::{Action, PermissionGate, ResourceRef, require};
use crate::ports::{PortForwardingManager, PortMapping};
use crate::resources::{
    Protocol, ValidatedResources, check_container_name, check_image, check_resources,
};
use crate::retry::DaemonPolicy;
use crate::runtime::{
    ContainerInspect, ContainerRuntimeApi, CreateSpec, DaemonAction, DaemonEvent, DaemonState,
    MANAGED_LABEL, OWNER_LABEL, REQUEST_LABEL, RuntimeError, RuntimeResult,
};
use crate::terminal::{CloseReason, TerminalSessionManager};

/// Longest pause between event stream reconnects.
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Work items for the reconciliation task.
#[derive(Debug)]
enum Reconcile {
    Event(DaemonEvent),
    /// The event stream was re-established; events may have been missed.
    Resync,
}

/// Outcome of [`ContainerManager::restore`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    /// Containers loaded back into the registry.
    pub containers: usize,
    /// Rows dropped because the daemon no longer knows the container.
    pub dropped: usize,
    /// Port forwards re-established.
    pub forwards: usize,
}

/// Owns container lifecycle state.
///
/// Every mutation of one container runs under that container's lock, and
/// the lock is held only across the daemon call in flight plus the local
/// bookkeeping that follows it.
pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    policy: DaemonPolicy,
    store: Arc<dyn ContainerStore>,
    registry: Arc<ContainerRegistry>,
    gate: Arc<dyn PermissionGate>,
    terminals: TerminalSessionManager,
    ports: Arc<PortForwardingManager>,
    stop_timeout_secs: u32,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        policy: DaemonPolicy,
        store: Arc<dyn ContainerStore>,
        registry: Arc<ContainerRegistry>,
        gate: Arc<dyn PermissionGate>,
        terminals: TerminalSessionManager,
        ports: Arc<PortForwardingManager>,
        stop_timeout_secs: u32,
    ) -> Self {
        Self {
            runtime,
            policy,
            store,
            registry,
            gate,
            terminals,
            ports,
            stop_timeout_secs,
        }
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Create and start a container owned by `user_id`.
    pub async fn create(
        &self,
        user_id: &str,
        request: CreateContainerRequest,
    ) -> WharfResult<Container> {
        require(
            self.gate.as_ref(),
            user_id,
            Action::CreateContainer,
            &ResourceRef::new_container(),
        )
        .await?;
        let validated = validate_request(&request)?;

        let name_guard = self.registry.lock_name(&request.name).await;
        let result = self.create_named(user_id, &request, validated).await;
        drop(name_guard);
        self.registry.prune_locks(None, Some(&request.name));
        result
    }

    async fn create_named(
        &self,
        user_id: &str,
        request: &CreateContainerRequest,
        validated: ValidatedResources,
    ) -> WharfResult<Container> {
        if self.registry.name_taken(&request.name) {
            return Err(WharfError::conflict(format!(
                "container name '{}' is already in use",
                request.name
            )));
        }

        let spec = CreateSpec {
            name: request.name.clone(),
            image: request.image.clone(),
            cpu_millis: validated.spec.cpu_millis,
            memory_bytes: validated.spec.memory_bytes,
            command: request.command.clone(),
            env: request.env.clone(),
            labels: HashMap::from([
                (OWNER_LABEL.to_string(), user_id.to_string()),
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (REQUEST_LABEL.to_string(), uuid::Uuid::new_v4().to_string()),
            ]),
        };
        let id = self
            .create_on_daemon(&spec)
            .await
            .map_err(|e| {
                WharfError::from(e).context(format!("creating container {}", request.name))
            })?;
        debug!("daemon created container {} as {}", request.name, id);

        let now = Utc::now();
        let container = Container {
            id: id.clone(),
            name: request.name.clone(),
            image: request.image.clone(),
            owner_id: user_id.to_string(),
            status: ContainerStatus::Creating,
            resources: validated.spec,
            declared_ports: validated.ports,
            port_mappings: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };

        let guard = self.registry.lock(&id).await;
        let result = self.start_created(container).await;
        drop(guard);
        self.registry.prune_locks(Some(&id), None);
        result
    }

    /// Daemon create with retries.
    ///
    /// An attempt that timed out may still have created the container, in
    /// which case a retry only sees a name conflict. Whenever the outcome is
    /// uncertain the name is looked up, and a container carrying this
    /// request's label is taken as the result.
    async fn create_on_daemon(&self, spec: &CreateSpec) -> RuntimeResult<String> {
        let attempts = AtomicU32::new(0);
        let result = self
            .policy
            .call("create", || {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.runtime.create_container(spec)
            })
            .await;

        let err = match result {
            Ok(id) => return Ok(id),
            Err(err) => err,
        };
        let uncertain =
            attempts.load(Ordering::Relaxed) > 1 || matches!(err, RuntimeError::Timeout { .. });
        if !uncertain {
            return Err(err);
        }

        let request_id = spec.labels.get(REQUEST_LABEL);
        match self
            .policy
            .call("inspect", || self.runtime.inspect_container(&spec.name))
            .await
        {
            Ok(Some(found))
                if request_id.is_some() && found.labels.get(REQUEST_LABEL) == request_id =>
            {
                info!(
                    "container {} was created by an unanswered attempt, using {}",
                    spec.name, found.id
                );
                Ok(found.id)
            }
            Ok(_) => Err(err),
            Err(e) => {
                warn!(
                    "cannot check for container {} after failed create: {}",
                    spec.name, e
                );
                Err(err)
            }
        }
    }

    /// Second half of `create`: record, start, forward. Rolls the daemon
    /// container back if it cannot be started.
    async fn start_created(&self, container: Container) -> WharfResult<Container> {
        let id = container.id.clone();
        if let Err(e) = self.registry.insert(container.clone()) {
            self.discard(&id).await;
            return Err(e);
        }
        if let Err(e) = self.store.save_container(&container).await {
            self.registry.remove(&id);
            self.discard(&id).await;
            return Err(WharfError::store(e));
        }

        if let Err(e) = self
            .policy
            .call("start", || self.runtime.start_container(&id))
            .await
        {
            warn!(
                "failed to start new container {} ({}), rolling back: {}",
                container.name, id, e
            );
            self.discard(&id).await;
            self.registry.remove(&id);
            if let Err(e) = self.store.delete_container(&id).await {
                warn!("failed to delete container {} from store: {:#}", id, e);
            }
            return Err(WharfError::from(e).context(format!("starting container {}", container.name)));
        }

        let running = self
            .registry
            .transition(&id, ContainerStatus::Running, None)?;
        self.persist(&running).await;
        self.forward_declared(&running).await;
        info!(
            "created container {} ({}) for user {} from {}",
            running.name, running.id, running.owner_id, running.image
        );
        Ok(self.with_mappings(running))
    }

    /// Best-effort removal of a daemon container that never became usable.
    async fn discard(&self, id: &str) {
        match self
            .policy
            .call("remove", || self.runtime.remove_container(id, true))
            .await
        {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => error!("failed to roll back container {}: {}", id, e),
        }
    }

    pub async fn start(&self, user_id: &str, id: &str) -> WharfResult<Container> {
        self.authorize_mutation(user_id, id, Action::StartContainer)
            .await?;

        let mut attempt = 0;
        let _guard = loop {
            attempt += 1;
            let guard = self.registry.lock(id).await;
            let current = self.mutable_snapshot(id)?;
            if current.status == ContainerStatus::Running {
                return Ok(self.with_mappings(current));
            }
            match self
                .policy
                .once("start", self.runtime.start_container(id))
                .await
            {
                Ok(()) => break guard,
                Err(e) => match self.policy.retry_delay("start", attempt, &e) {
                    Some(backoff) => {
                        drop(guard);
                        tokio::time::sleep(backoff).await;
                    }
                    None => return Err(self.daemon_failure(id, "start", e).await),
                },
            }
        };

        let running = self
            .registry
            .transition(id, ContainerStatus::Running, None)?;
        self.persist(&running).await;
        self.forward_declared(&running).await;
        info!("started container {} ({})", running.name, id);
        Ok(self.with_mappings(running))
    }

    /// Stop a container. Its terminal sessions are closed and its port
    /// forwards released before this returns.
    pub async fn stop(&self, user_id: &str, id: &str) -> WharfResult<Container> {
        self.authorize_mutation(user_id, id, Action::StopContainer)
            .await?;

        let mut attempt = 0;
        let _guard = loop {
            attempt += 1;
            let guard = self.registry.lock(id).await;
            let current = self.mutable_snapshot(id)?;
            if current.status == ContainerStatus::Stopped {
                return Ok(self.with_mappings(current));
            }
            match self
                .policy
                .once(
                    "stop",
                    self.runtime
                        .stop_container(id, Some(self.stop_timeout_secs)),
                )
                .await
            {
                Ok(()) => break guard,
                Err(e) => match self.policy.retry_delay("stop", attempt, &e) {
                    Some(backoff) => {
                        drop(guard);
                        tokio::time::sleep(backoff).await;
                    }
                    None => return Err(self.daemon_failure(id, "stop", e).await),
                },
            }
        };

        let sessions = self
            .terminals
            .close_for_container(id, CloseReason::ContainerStopped);
        let forwards = self.ports.release_container(id).await;
        let stopped = self
            .registry
            .transition(id, ContainerStatus::Stopped, None)?;
        self.persist(&stopped).await;
        info!(
            "stopped container {} ({}), closed {} session(s), released {} forward(s)",
            stopped.name, id, sessions, forwards
        );
        Ok(stopped)
    }

    /// Remove a container. Sessions and forwards are torn down first; local
    /// state is cleared only after the daemon confirms the removal.
    pub async fn remove(&self, user_id: &str, id: &str) -> WharfResult<()> {
        self.authorize_mutation(user_id, id, Action::RemoveContainer)
            .await?;
        let guard = self.registry.lock(id).await;
        let result = self.remove_locked(id, guard).await;
        self.registry.prune_locks(Some(id), None);
        result
    }

    /// Body of `remove`. The lock is released while backing off between
    /// attempts; the container stays `Removing` meanwhile, which every
    /// other mutation refuses.
    async fn remove_locked(&self, id: &str, mut guard: OwnedMutexGuard<()>) -> WharfResult<()> {
        self.mutable_snapshot(id)?;
        let removing = self
            .registry
            .transition(id, ContainerStatus::Removing, None)?;
        self.persist(&removing).await;

        let sessions = self
            .terminals
            .close_for_container(id, CloseReason::ContainerRemoved);
        let forwards = self.ports.release_container(id).await;

        let mut attempt = 0;
        let removed = loop {
            attempt += 1;
            let result = self
                .policy
                .once("remove", self.runtime.remove_container(id, true))
                .await;
            match result {
                Err(e) => match self.policy.retry_delay("remove", attempt, &e) {
                    Some(backoff) => {
                        drop(guard);
                        tokio::time::sleep(backoff).await;
                        guard = self.registry.lock(id).await;
                    }
                    None => break Err(e),
                },
                ok => break ok,
            }
        };
        match removed {
            Ok(()) | Err(RuntimeError::NotFound(_)) => {}
            Err(e) => {
                let err = WharfError::from(e).context(format!("removing container {id}"));
                let failed = self.registry.transition(
                    id,
                    ContainerStatus::Error,
                    Some(err.to_string()),
                )?;
                self.persist(&failed).await;
                return Err(err);
            }
        }

        self.registry.remove(id);
        drop(guard);
        if let Err(e) = self.store.delete_container(id).await {
            warn!("failed to delete container {} from store: {:#}", id, e);
        }
        info!(
            "removed container {} ({}), closed {} session(s), released {} forward(s)",
            removing.name, id, sessions, forwards
        );
        Ok(())
    }

    /// Turn a failed start/stop into an error, moving the container to
    /// `Error` when the daemon failed outright.
    async fn daemon_failure(&self, id: &str, command: &str, err: RuntimeError) -> WharfError {
        let unrecoverable = matches!(err, RuntimeError::CommandFailed { .. });
        let err = WharfError::from(err).context(format!("{command} container {id}"));
        if unrecoverable {
            match self
                .registry
                .transition(id, ContainerStatus::Error, Some(err.to_string()))
            {
                Ok(failed) => self.persist(&failed).await,
                Err(e) => debug!("container {} not moved to error: {}", id, e),
            }
        }
        err
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, user_id: &str, id: &str) -> WharfResult<Container> {
        let container = self.snapshot(id)?;
        require(
            self.gate.as_ref(),
            user_id,
            Action::ViewContainer,
            &ResourceRef::container(&container.id, &container.owner_id),
        )
        .await?;
        Ok(self.with_mappings(container))
    }

    /// Containers `user_id` may see, oldest first.
    pub async fn list(&self, user_id: &str) -> Vec<Container> {
        let mut visible = Vec::new();
        for container in self.registry.list() {
            let resource = ResourceRef::container(&container.id, &container.owner_id);
            if self
                .gate
                .authorize(user_id, Action::ViewContainer, &resource)
                .await
                .is_allowed()
            {
                visible.push(self.with_mappings(container));
            }
        }
        visible
    }

    // ========================================================================
    // Port forwarding
    // ========================================================================

    /// Forward a host port to one of the container's declared ports.
    pub async fn forward_port(
        &self,
        user_id: &str,
        id: &str,
        container_port: u16,
        protocol: Protocol,
    ) -> WharfResult<PortMapping> {
        let container = self
            .authorize_mutation(user_id, id, Action::ForwardPort)
            .await?;
        if !container
            .declared_ports
            .iter()
            .any(|p| p.container_port == container_port && p.protocol == protocol)
        {
            return Err(WharfError::validation(format!(
                "port {container_port}/{protocol} was not declared for container {}",
                container.name
            )));
        }

        let _guard = self.registry.lock(id).await;
        let current = self.mutable_snapshot(id)?;
        if current.status != ContainerStatus::Running {
            return Err(WharfError::conflict(format!(
                "container {id} is {}, not running",
                current.status
            )));
        }
        self.ports.forward(id, container_port, protocol).await
    }

    /// Release a forward. Returns `Ok(false)` if it was already released.
    pub async fn unforward_port(&self, user_id: &str, mapping_id: &str) -> WharfResult<bool> {
        let Some(mapping) = self.ports.get(mapping_id) else {
            require(
                self.gate.as_ref(),
                user_id,
                Action::UnforwardPort,
                &ResourceRef::released_mapping(mapping_id),
            )
            .await?;
            return Ok(false);
        };
        let owner = self
            .registry
            .get(&mapping.container_id)
            .map(|c| c.owner_id)
            .ok_or_else(|| {
                WharfError::not_found(format!(
                    "container {} of port mapping {mapping_id}",
                    mapping.container_id
                ))
            })?;
        require(
            self.gate.as_ref(),
            user_id,
            Action::UnforwardPort,
            &ResourceRef::mapping(mapping_id, owner),
        )
        .await?;
        self.ports.unforward(mapping_id).await
    }

    pub async fn list_ports(&self, user_id: &str, id: &str) -> WharfResult<Vec<PortMapping>> {
        let container = self.snapshot(id)?;
        require(
            self.gate.as_ref(),
            user_id,
            Action::ViewPorts,
            &ResourceRef::container(&container.id, &container.owner_id),
        )
        .await?;
        Ok(self.ports.list(id))
    }

    /// Forward every declared port that has no active forward yet.
    async fn forward_declared(&self, container: &Container) -> usize {
        let existing = self.ports.list(&container.id);
        let mut forwarded = 0;
        for port in &container.declared_ports {
            if existing
                .iter()
                .any(|m| m.container_port == port.container_port && m.protocol == port.protocol)
            {
                continue;
            }
            match self
                .ports
                .forward(&container.id, port.container_port, port.protocol)
                .await
            {
                Ok(_) => forwarded += 1,
                Err(e) => warn!(
                    "failed to forward port {}/{} of container {}: {}",
                    port.container_port, port.protocol, container.id, e
                ),
            }
        }
        forwarded
    }

    // ========================================================================
    // Startup and reconciliation
    // ========================================================================

    /// Load persisted containers, check each against the daemon and
    /// re-establish forwards of running ones.
    pub async fn restore(&self) -> WharfResult<RestoreReport> {
        let containers = self
            .store
            .load_containers()
            .await
            .map_err(WharfError::store)?;
        let mut mappings = self
            .store
            .load_mappings()
            .await
            .map_err(WharfError::store)?;
        let mut report = RestoreReport::default();

        for mut container in containers {
            let id = container.id.clone();
            let inspect = self
                .policy
                .call("inspect", || self.runtime.inspect_container(&id))
                .await
                .map_err(|e| WharfError::from(e).context(format!("restoring container {id}")))?;

            let Some(inspect) = inspect else {
                info!("container {} ({}) is gone, dropping it", container.name, id);
                if let Err(e) = self.store.delete_container(&id).await {
                    warn!("failed to delete container {} from store: {:#}", id, e);
                }
                report.dropped += 1;
                continue;
            };

            if container.status == ContainerStatus::Removing {
                // Interrupted removal: finish it.
                match self
                    .policy
                    .call("remove", || self.runtime.remove_container(&id, true))
                    .await
                {
                    Ok(()) | Err(RuntimeError::NotFound(_)) => {
                        if let Err(e) = self.store.delete_container(&id).await {
                            warn!("failed to delete container {} from store: {:#}", id, e);
                        }
                        report.dropped += 1;
                        continue;
                    }
                    Err(e) => {
                        container.status = ContainerStatus::Error;
                        container.error_message = Some(
                            WharfError::from(e)
                                .context(format!("removing container {id}"))
                                .to_string(),
                        );
                    }
                }
            } else {
                let observed = restored_status(container.status, &inspect);
                if observed != container.status {
                    container.status = observed;
                    if observed == ContainerStatus::Error {
                        container.error_message =
                            Some(format!("daemon reports container as {:?}", inspect.state));
                    } else {
                        container.error_message = None;
                    }
                }
            }
            container.updated_at = Utc::now();

            self.registry.insert(container.clone())?;
            self.persist(&container).await;
            report.containers += 1;

            let (own, rest): (Vec<PortMapping>, Vec<PortMapping>) =
                mappings.into_iter().partition(|m| m.container_id == id);
            mappings = rest;
            if container.status == ContainerStatus::Running {
                for mapping in &own {
                    match self.ports.restore(mapping).await {
                        Ok(restored) => {
                            report.forwards += 1;
                            if restored.host_port != mapping.host_port {
                                info!(
                                    "host port {} of container {} moved to {}",
                                    mapping.host_port, id, restored.host_port
                                );
                            }
                        }
                        Err(e) => warn!(
                            "failed to restore forward {} of container {}: {}",
                            mapping.id, id, e
                        ),
                    }
                }
                report.forwards += self.forward_declared(&container).await;
            } else {
                for mapping in &own {
                    if let Err(e) = self.store.delete_mapping(&mapping.id).await {
                        warn!("failed to delete mapping {} from store: {:#}", mapping.id, e);
                    }
                }
            }
        }

        info!(
            "restored {} container(s), dropped {}, re-established {} forward(s)",
            report.containers, report.dropped, report.forwards
        );
        Ok(report)
    }

    /// Apply one daemon event.
    ///
    /// Events only say which container to look at: the container is
    /// re-inspected under its lock and the observed state applied, so stale
    /// or duplicated events are harmless. Unknown ids are ignored.
    pub async fn apply_event(&self, event: &DaemonEvent) {
        match event.action {
            DaemonAction::Start
            | DaemonAction::Restart
            | DaemonAction::Unpause
            | DaemonAction::Stop
            | DaemonAction::Die
            | DaemonAction::Kill
            | DaemonAction::Oom
            | DaemonAction::Destroy => {}
            _ => return,
        }
        if !self.registry.contains(&event.container_id) {
            debug!(
                "ignoring {:?} event for unmanaged container {}",
                event.action, event.container_id
            );
            return;
        }
        self.reconcile(&event.container_id).await;
    }

    /// Bring one container in line with what the daemon reports.
    pub async fn reconcile(&self, id: &str) {
        // Create and remove settle the state themselves; don't queue behind them.
        if matches!(
            self.registry.status(id),
            None | Some(ContainerStatus::Creating | ContainerStatus::Removing)
        ) {
            return;
        }
        let guard = self.registry.lock(id).await;
        self.reconcile_locked(id).await;
        drop(guard);
        self.registry.prune_locks(Some(id), None);
    }

    async fn reconcile_locked(&self, id: &str) {
        let Some(current) = self.registry.get(id) else {
            return;
        };
        if matches!(
            current.status,
            ContainerStatus::Creating | ContainerStatus::Removing
        ) {
            return;
        }

        let observed = match self
            .policy
            .once("inspect", self.runtime.inspect_container(id))
            .await
        {
            Ok(observed) => observed,
            Err(e) => {
                // The next event or resync tries again.
                warn!("cannot reconcile container {}: {}", id, e);
                return;
            }
        };

        let Some(inspect) = observed else {
            info!(
                "container {} ({}) was removed outside wharf",
                current.name, id
            );
            self.terminals
                .close_for_container(id, CloseReason::ContainerRemoved);
            self.ports.release_container(id).await;
            self.registry.remove(id);
            if let Err(e) = self.store.delete_container(id).await {
                warn!("failed to delete container {} from store: {:#}", id, e);
            }
            return;
        };

        let next = match inspect.state {
            DaemonState::Running => ContainerStatus::Running,
            DaemonState::Exited | DaemonState::Created => ContainerStatus::Stopped,
            DaemonState::Dead => ContainerStatus::Error,
            _ => return,
        };
        if next == current.status {
            return;
        }
        let message = (next == ContainerStatus::Error).then(|| "container is dead".to_string());
        let updated = match self.registry.transition(id, next, message) {
            Ok(updated) => updated,
            Err(e) => {
                debug!("not applying observed state of {}: {}", id, e);
                return;
            }
        };
        self.persist(&updated).await;
        info!(
            "container {} ({}) is now {} (was {})",
            updated.name, id, updated.status, current.status
        );

        if next == ContainerStatus::Running {
            self.forward_declared(&updated).await;
        } else {
            self.terminals
                .close_for_container(id, CloseReason::ContainerStopped);
            self.ports.release_container(id).await;
        }
    }

    /// Re-check every known container.
    pub async fn resync(&self) {
        for container in self.registry.list() {
            self.reconcile(&container.id).await;
        }
    }

    /// Start the reconciliation task: one pump reading the daemon event
    /// stream (resubscribing with backoff when it ends) feeding one worker
    /// over a channel.
    pub fn spawn_reconciler(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::channel::<Reconcile>(256);
        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.runtime),
            self.policy,
            tx,
            cancel.clone(),
        ));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => break,
                    item = rx.recv() => item,
                };
                match item {
                    Some(Reconcile::Event(event)) => manager.apply_event(&event).await,
                    Some(Reconcile::Resync) => manager.resync().await,
                    None => break,
                }
            }
            pump.abort();
            debug!("reconciliation task stopped");
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn snapshot(&self, id: &str) -> WharfResult<Container> {
        self.registry
            .get(id)
            .ok_or_else(|| WharfError::not_found(format!("container {id}")))
    }

    /// Snapshot that refuses containers being removed.
    fn mutable_snapshot(&self, id: &str) -> WharfResult<Container> {
        let container = self.snapshot(id)?;
        match container.status {
            ContainerStatus::Removing => Err(WharfError::conflict(format!(
                "container {id} is being removed"
            ))),
            ContainerStatus::Creating => Err(WharfError::conflict(format!(
                "container {id} is still being created"
            ))),
            _ => Ok(container),
        }
    }

    /// Permission check plus the lock-free rejection of containers that are
    /// being created or removed.
    async fn authorize_mutation(
        &self,
        user_id: &str,
        id: &str,
        action: Action,
    ) -> WharfResult<Container> {
        let container = self.snapshot(id)?;
        require(
            self.gate.as_ref(),
            user_id,
            action,
            &ResourceRef::container(&container.id, &container.owner_id),
        )
        .await?;
        match container.status {
            ContainerStatus::Removing => Err(WharfError::conflict(format!(
                "container {id} is being removed"
            ))),
            ContainerStatus::Creating => Err(WharfError::conflict(format!(
                "container {id} is still being created"
            ))),
            _ => Ok(container),
        }
    }

    fn with_mappings(&self, mut container: Container) -> Container {
        container.port_mappings = self.ports.list(&container.id);
        container
    }

    async fn persist(&self, container: &Container) {
        if let Err(e) = self
            .store
            .update_status(
                &container.id,
                container.status,
                container.error_message.as_deref(),
                container.updated_at,
            )
            .await
        {
            warn!(
                "failed to persist status of container {}: {:#}",
                container.id, e
            );
        }
    }
}

fn validate_request(request: &CreateContainerRequest) -> WharfResult<ValidatedResources> {
    let mut violations = Violations::new();
    check_container_name(&request.name, &mut violations);
    check_image(&request.image, &mut violations);
    match check_resources(&request.resources, &mut violations) {
        Some(validated) if violations.is_empty() => Ok(validated),
        _ => Err(WharfError::Validation(violations)),
    }
}

/// Status to give a persisted container given what the daemon reports.
fn restored_status(stored: ContainerStatus, inspect: &ContainerInspect) -> ContainerStatus {
    match inspect.state {
        DaemonState::Running => ContainerStatus::Running,
        DaemonState::Exited | DaemonState::Created if stored == ContainerStatus::Error => {
            ContainerStatus::Error
        }
        DaemonState::Exited | DaemonState::Created => ContainerStatus::Stopped,
        DaemonState::Dead => ContainerStatus::Error,
        _ if stored == ContainerStatus::Creating => ContainerStatus::Error,
        _ => stored,
    }
}

async fn pump_events(
    runtime: Arc<dyn ContainerRuntimeApi>,
    policy: DaemonPolicy,
    tx: mpsc::Sender<Reconcile>,
    cancel: CancellationToken,
) {
    let mut failures: u32 = 0;
    let mut subscribed_before = false;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match policy.once("events", runtime.subscribe_events()).await {
            Ok(mut stream) => {
                failures = 0;
                if subscribed_before {
                    info!("resubscribed to container runtime events");
                    if tx.send(Reconcile::Resync).await.is_err() {
                        return;
                    }
                } else {
                    info!("subscribed to container runtime events");
                }
                subscribed_before = true;

                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if tx.send(Reconcile::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => debug!("skipping unreadable runtime event: {}", e),
                        None => break,
                    }
                }
                warn!("container runtime event stream ended");
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                warn!("cannot subscribe to container runtime events: {}", e);
            }
        }

        let delay = policy
            .base_delay
            .saturating_mul(2u32.saturating_pow(failures.min(16)))
            .min(MAX_RESUBSCRIBE_DELAY);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceRequest;

    fn inspect(state: DaemonState) -> ContainerInspect {
        ContainerInspect {
            id: "c1".to_string(),
            name: "dev".to_string(),
            state,
            ip_address: None,
            labels: HashMap::new(),
        }
    }

    #[test]
    fn test_restored_status_follows_daemon() {
        use ContainerStatus::*;
        assert_eq!(restored_status(Stopped, &inspect(DaemonState::Running)), Running);
        assert_eq!(restored_status(Running, &inspect(DaemonState::Exited)), Stopped);
        assert_eq!(restored_status(Error, &inspect(DaemonState::Exited)), Error);
        assert_eq!(restored_status(Running, &inspect(DaemonState::Paused)), Running);
        assert_eq!(restored_status(Creating, &inspect(DaemonState::Paused)), Error);
    }

    #[test]
    fn test_validate_request_aggregates_every_violation() {
        let request = CreateContainerRequest::new(
            "-bad name",
            "",
            ResourceRequest {
                cpus: 0.4,
                memory: "lots".to_string(),
                ports: Vec::new(),
            },
        );
        let err = validate_request(&request).unwrap_err();
        match err {
            WharfError::Validation(violations) => assert!(violations.len() >= 4),
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}

//! Interactive terminal sessions.
//!
//! A session is a PTY process running inside a container, exposed to the
//! client as a [`TerminalStream`]. Opening a session reserves a slot in the
//! owner's quota; every way a session can end (process exit, container
//! stop or removal, idle timeout, explicit close) funnels into one teardown
//! that kills the PTY and returns the slot exactly once.

mod quota;
mod session;

pub use quota::{QuotaTracker, UNLIMITED};
pub use session::{
    CloseReason, SessionStatus, TerminalInput, TerminalOutput, TerminalSessionInfo,
    TerminalStream,
};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RuntimeSettings, TerminalSettings};
use crate::container::{ContainerRegistry, ContainerStatus};
use crate::error::{WharfError, WharfResult};
use crate::permissions::{Action, PermissionGate, ResourceRef, require};
use crate::retry::DaemonPolicy;
use crate::runtime::{ContainerRuntimeApi, ExecRequest, PtyProcess, TerminalSize};

use session::Session;

/// How terminal sessions are spawned and limited.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    /// Command run inside the container.
    pub shell: Vec<String>,
    /// Value of `TERM` for the process.
    pub term: String,
    pub initial_size: TerminalSize,
    pub default_limit: i64,
    pub user_limits: HashMap<String, i64>,
    /// `None` disables the idle sweep.
    pub idle_timeout: Option<Duration>,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::from_settings(&RuntimeSettings::default(), &TerminalSettings::default())
    }
}

impl TerminalOptions {
    pub fn from_settings(runtime: &RuntimeSettings, terminal: &TerminalSettings) -> Self {
        Self {
            shell: runtime.shell.clone(),
            term: runtime.term.clone(),
            initial_size: TerminalSize {
                rows: terminal.rows,
                cols: terminal.cols,
            },
            default_limit: terminal.default_session_limit,
            user_limits: terminal.user_limits.clone(),
            idle_timeout: (terminal.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(terminal.idle_timeout_secs)),
        }
    }
}

struct Shared {
    runtime: Arc<dyn ContainerRuntimeApi>,
    policy: DaemonPolicy,
    registry: Arc<ContainerRegistry>,
    gate: Arc<dyn PermissionGate>,
    quota: QuotaTracker,
    sessions: DashMap<String, Arc<Session>>,
    options: TerminalOptions,
}

impl Shared {
    /// The single teardown path. Safe to call from any trigger, any number
    /// of times; only the first call for a session does anything.
    fn teardown(&self, session: &Arc<Session>, reason: CloseReason) -> bool {
        if !session.begin_close(reason) {
            return false;
        }
        if let Some(Err(e)) = session.kill_pty() {
            warn!("failed to kill terminal process of session {}: {}", session.id, e);
        }
        self.quota.release(&session.owner_id);
        self.sessions.remove(&session.id);
        session.finish_close();
        info!(
            "closed terminal session {} on container {} for user {} ({})",
            session.id, session.container_id, session.owner_id, reason
        );
        true
    }

    fn lookup(&self, session_id: &str) -> WharfResult<Arc<Session>> {
        self.sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| WharfError::not_found(format!("terminal session {session_id}")))
    }
}

/// A session between quota reservation and attach. Dropping it without
/// [`PendingOpen::attached`] tears the session down, which also covers an
/// `open` future dropped by its caller.
struct PendingOpen<'a> {
    shared: &'a Shared,
    session: Arc<Session>,
    armed: bool,
}

impl<'a> PendingOpen<'a> {
    fn new(shared: &'a Shared, session: Arc<Session>) -> Self {
        Self {
            shared,
            session,
            armed: true,
        }
    }

    fn attached(mut self) -> Arc<Session> {
        self.armed = false;
        Arc::clone(&self.session)
    }
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if self.armed && self.shared.teardown(&self.session, CloseReason::SpawnFailed) {
            debug!("terminal session {} abandoned before attach", self.session.id);
        }
    }
}

/// Creates, tracks and tears down terminal sessions.
#[derive(Clone)]
pub struct TerminalSessionManager {
    shared: Arc<Shared>,
}

impl TerminalSessionManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        policy: DaemonPolicy,
        registry: Arc<ContainerRegistry>,
        gate: Arc<dyn PermissionGate>,
        options: TerminalOptions,
    ) -> WharfResult<Self> {
        if options.shell.is_empty() {
            return Err(WharfError::validation("terminal shell command cannot be empty"));
        }
        let quota = QuotaTracker::new(options.default_limit, options.user_limits.clone())?;
        Ok(Self {
            shared: Arc::new(Shared {
                runtime,
                policy,
                registry,
                gate,
                quota,
                sessions: DashMap::new(),
                options,
            }),
        })
    }

    /// Open a terminal on a running container.
    pub async fn open(&self, user_id: &str, container_id: &str) -> WharfResult<TerminalStream> {
        let shared = &self.shared;
        let container = shared
            .registry
            .get(container_id)
            .ok_or_else(|| WharfError::not_found(format!("container {container_id}")))?;
        require(
            shared.gate.as_ref(),
            user_id,
            Action::OpenTerminal,
            &ResourceRef::container(&container.id, &container.owner_id),
        )
        .await?;

        // State is checked before the quota so a refused open costs nothing.
        if container.status != ContainerStatus::Running {
            return Err(WharfError::conflict(format!(
                "container {container_id} is {}, not running",
                container.status
            )));
        }
        shared.quota.reserve(user_id)?;

        let session = Arc::new(Session::new(container_id, user_id));
        shared
            .sessions
            .insert(session.id.clone(), Arc::clone(&session));
        let pending = PendingOpen::new(shared, Arc::clone(&session));
        debug!(
            "terminal session {} pending on container {} for user {}",
            session.id, container_id, user_id
        );

        let request = ExecRequest {
            command: shared.options.shell.clone(),
            env: vec![("TERM".to_string(), shared.options.term.clone())],
            size: shared.options.initial_size,
        };
        // One exec attempt per lock acquisition; the container may be
        // stopped while we back off.
        let mut attempt = 0;
        let (guard, process) = loop {
            attempt += 1;
            let guard = shared.registry.lock(container_id).await;
            if shared.registry.status(container_id) != Some(ContainerStatus::Running) {
                return Err(WharfError::conflict(format!(
                    "container {container_id} stopped before the terminal was attached"
                )));
            }
            match shared
                .policy
                .once("exec", shared.runtime.exec_attach(container_id, &request))
                .await
            {
                Ok(process) => break (guard, process),
                Err(e) => match shared.policy.retry_delay("exec", attempt, &e) {
                    Some(backoff) => {
                        drop(guard);
                        tokio::time::sleep(backoff).await;
                    }
                    None => {
                        warn!(
                            "failed to spawn terminal on container {}: {}",
                            container_id, e
                        );
                        return Err(
                            WharfError::from(e).context(format!("container {container_id}"))
                        );
                    }
                },
            }
        };
        let PtyProcess {
            input,
            output,
            exit,
            control,
        } = process;

        if !session.attach(input, control) {
            return Err(WharfError::SessionTerminated(format!(
                "session {} closed while attaching",
                session.id
            )));
        }
        let session = pending.attached();

        let watcher_shared = Arc::clone(&self.shared);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            tokio::select! {
                _ = watched.cancel.cancelled() => {}
                code = exit => {
                    debug!(
                        "terminal process of session {} exited with {:?}",
                        watched.id,
                        code.ok().flatten()
                    );
                    watcher_shared.teardown(&watched, CloseReason::ProcessExited);
                }
            }
        });
        drop(guard);

        info!(
            "opened terminal session {} on container {} for user {}",
            session.id, container_id, user_id
        );
        Ok(TerminalStream::new(session, output))
    }

    pub async fn get(&self, user_id: &str, session_id: &str) -> WharfResult<TerminalSessionInfo> {
        let session = self.shared.lookup(session_id)?;
        require(
            self.shared.gate.as_ref(),
            user_id,
            Action::ViewTerminal,
            &ResourceRef::session(&session.id, &session.owner_id),
        )
        .await?;
        Ok(session.info())
    }

    /// Live sessions owned by `user_id`, oldest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<TerminalSessionInfo> {
        let mut sessions: Vec<TerminalSessionInfo> = self
            .shared
            .sessions
            .iter()
            .filter(|s| s.owner_id == user_id)
            .map(|s| s.info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Live sessions attached to a container.
    pub fn list_for_container(&self, container_id: &str) -> Vec<TerminalSessionInfo> {
        let mut sessions: Vec<TerminalSessionInfo> = self
            .shared
            .sessions
            .iter()
            .filter(|s| s.container_id == container_id)
            .map(|s| s.info())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Close a session on behalf of a user.
    pub async fn close(&self, user_id: &str, session_id: &str) -> WharfResult<()> {
        let session = self.shared.lookup(session_id)?;
        require(
            self.shared.gate.as_ref(),
            user_id,
            Action::CloseTerminal,
            &ResourceRef::session(&session.id, &session.owner_id),
        )
        .await?;
        self.shared.teardown(&session, CloseReason::Requested);
        Ok(())
    }

    /// Close every session on a container. Returns how many were closed.
    ///
    /// Does not take the container lock; lifecycle operations call it while
    /// holding that lock.
    pub fn close_for_container(&self, container_id: &str, reason: CloseReason) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .filter(|s| s.container_id == container_id)
            .map(|s| Arc::clone(s.value()))
            .collect();
        sessions
            .iter()
            .filter(|s| self.shared.teardown(s, reason))
            .count()
    }

    /// Close sessions without traffic for longer than `threshold`.
    pub fn close_idle(&self, threshold: Duration) -> usize {
        let now = Utc::now();
        let idle: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .filter(|s| s.status().is_live() && s.idle_for(now) > threshold)
            .map(|s| Arc::clone(s.value()))
            .collect();
        let closed = idle
            .iter()
            .filter(|s| self.shared.teardown(s, CloseReason::IdleTimeout))
            .count();
        if closed > 0 {
            info!("closed {} idle terminal session(s)", closed);
        }
        closed
    }

    /// Start the periodic idle sweep. Returns `None` when idle timeouts are
    /// disabled.
    pub fn start_idle_sweeper(
        &self,
        check_interval: Duration,
        cancel: CancellationToken,
    ) -> Option<JoinHandle<()>> {
        let threshold = self.shared.options.idle_timeout?;
        info!(
            "starting idle terminal sweep (check every {:?}, timeout {:?})",
            check_interval, threshold
        );
        let manager = self.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        manager.close_idle(threshold);
                    }
                }
            }
        }))
    }

    /// Change the deployment-wide session limit. Applies to later opens.
    pub async fn set_default_limit(&self, admin_id: &str, limit: i64) -> WharfResult<()> {
        require(
            self.shared.gate.as_ref(),
            admin_id,
            Action::ManageQuota,
            &ResourceRef::quota(None),
        )
        .await?;
        self.shared.quota.set_default_limit(limit)?;
        info!("default terminal session limit set to {} by {}", limit, admin_id);
        Ok(())
    }

    /// Set (`Some`) or clear (`None`) one user's session limit.
    pub async fn set_user_limit(
        &self,
        admin_id: &str,
        user_id: &str,
        limit: Option<i64>,
    ) -> WharfResult<()> {
        require(
            self.shared.gate.as_ref(),
            admin_id,
            Action::ManageQuota,
            &ResourceRef::quota(Some(user_id)),
        )
        .await?;
        self.shared.quota.set_user_limit(user_id, limit)?;
        info!(
            "terminal session limit for {} set to {:?} by {}",
            user_id, limit, admin_id
        );
        Ok(())
    }

    /// Close the newest sessions of users above their current limit.
    pub async fn enforce_limits(&self, admin_id: &str) -> WharfResult<usize> {
        require(
            self.shared.gate.as_ref(),
            admin_id,
            Action::ManageQuota,
            &ResourceRef::quota(None),
        )
        .await?;

        let mut closed = 0;
        for (user_id, excess) in self.shared.quota.over_limit() {
            let mut sessions: Vec<Arc<Session>> = self
                .shared
                .sessions
                .iter()
                .filter(|s| s.owner_id == user_id && s.status().is_live())
                .map(|s| Arc::clone(s.value()))
                .collect();
            sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            for session in sessions.iter().take(excess) {
                if self.shared.teardown(session, CloseReason::OverQuota) {
                    closed += 1;
                }
            }
        }
        if closed > 0 {
            info!("closed {} terminal session(s) above quota", closed);
        }
        Ok(closed)
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.shared.quota
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Close every session (service shutdown).
    pub fn shutdown(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .shared
            .sessions
            .iter()
            .map(|s| Arc::clone(s.value()))
            .collect();
        sessions
            .iter()
            .filter(|s| self.shared.teardown(s, CloseReason::Shutdown))
            .count()
    }
}

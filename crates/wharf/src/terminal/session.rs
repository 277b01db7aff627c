//! Terminal session state and the client-facing duplex stream.

use std::sync::atomic::{AtomicI64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{WharfError, WharfResult};
use crate::runtime::{PtyControl, RuntimeResult, TerminalSize};

/// Terminal session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionStatus {
    /// Quota reserved, PTY not spawned yet.
    Pending = 0,
    /// PTY spawned, no data exchanged yet.
    Attached = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionStatus::Pending,
            1 => SessionStatus::Attached,
            2 => SessionStatus::Active,
            3 => SessionStatus::Closing,
            _ => SessionStatus::Closed,
        }
    }

    /// Whether the session counts against its owner's quota.
    pub fn is_live(self) -> bool {
        self < SessionStatus::Closing
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Pending => write!(f, "pending"),
            SessionStatus::Attached => write!(f, "attached"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Closing => write!(f, "closing"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ProcessExited,
    ContainerStopped,
    ContainerRemoved,
    IdleTimeout,
    Requested,
    OverQuota,
    SpawnFailed,
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CloseReason::ProcessExited => "process exited",
            CloseReason::ContainerStopped => "container stopped",
            CloseReason::ContainerRemoved => "container removed",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::Requested => "closed by user",
            CloseReason::OverQuota => "over session quota",
            CloseReason::SpawnFailed => "terminal spawn failed",
            CloseReason::Shutdown => "service shutdown",
        };
        f.write_str(text)
    }
}

/// Snapshot of a terminal session.
#[derive(Debug, Clone, Serialize)]
pub struct TerminalSessionInfo {
    pub id: String,
    pub container_id: String,
    pub owner_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub close_reason: Option<CloseReason>,
}

struct Attachment {
    input: mpsc::Sender<Bytes>,
    control: Box<dyn PtyControl>,
}

/// Shared state of one session.
pub(crate) struct Session {
    pub(crate) id: String,
    pub(crate) container_id: String,
    pub(crate) owner_id: String,
    pub(crate) created_at: DateTime<Utc>,
    status: AtomicU8,
    last_activity_ms: AtomicI64,
    pty: OnceLock<Attachment>,
    close_reason: Mutex<Option<CloseReason>>,
    /// Cancelled when the session starts closing; stops all forwarding.
    pub(crate) cancel: CancellationToken,
}

impl Session {
    pub(crate) fn new(container_id: &str, owner_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
            owner_id: owner_id.to_string(),
            created_at: now,
            status: AtomicU8::new(SessionStatus::Pending as u8),
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            pty: OnceLock::new(),
            close_reason: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    fn compare_exchange(&self, from: SessionStatus, to: SessionStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub(crate) fn last_activity(&self) -> DateTime<Utc> {
        let ms = self.last_activity_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(self.created_at)
    }

    pub(crate) fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity()).to_std().unwrap_or_default()
    }

    /// Hand the session its PTY. Returns `false` if the session started
    /// closing while the PTY was spawning; the PTY is killed in that case.
    pub(crate) fn attach(&self, input: mpsc::Sender<Bytes>, control: Box<dyn PtyControl>) -> bool {
        if self.status() != SessionStatus::Pending {
            let _ = control.kill();
            return false;
        }
        if let Err(attachment) = self.pty.set(Attachment { input, control }) {
            let _ = attachment.control.kill();
            return false;
        }
        if self.compare_exchange(SessionStatus::Pending, SessionStatus::Attached) {
            self.touch();
            true
        } else {
            // A close won the race and may have run before the PTY was set.
            let _ = self.kill_pty();
            false
        }
    }

    fn mark_active(&self) {
        self.touch();
        self.compare_exchange(SessionStatus::Attached, SessionStatus::Active);
    }

    /// Move to Closing. Only the first caller gets `true`.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let mut current = self.status.load(Ordering::SeqCst);
        loop {
            if !SessionStatus::from_u8(current).is_live() {
                return false;
            }
            match self.status.compare_exchange(
                current,
                SessionStatus::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if let Ok(mut slot) = self.close_reason.lock() {
            *slot = Some(reason);
        }
        self.cancel.cancel();
        true
    }

    pub(crate) fn finish_close(&self) {
        self.status
            .store(SessionStatus::Closed as u8, Ordering::SeqCst);
    }

    pub(crate) fn kill_pty(&self) -> Option<RuntimeResult<()>> {
        self.pty.get().map(|attachment| attachment.control.kill())
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().ok().and_then(|slot| *slot)
    }

    fn terminated(&self) -> WharfError {
        match self.close_reason() {
            Some(reason) => WharfError::SessionTerminated(format!("session {} ({reason})", self.id)),
            None => WharfError::SessionTerminated(format!("session {}", self.id)),
        }
    }

    pub(crate) fn info(&self) -> TerminalSessionInfo {
        TerminalSessionInfo {
            id: self.id.clone(),
            container_id: self.container_id.clone(),
            owner_id: self.owner_id.clone(),
            status: self.status(),
            created_at: self.created_at,
            last_activity_at: self.last_activity(),
            close_reason: self.close_reason(),
        }
    }

    async fn send(&self, data: Bytes) -> WharfResult<()> {
        if !self.status().is_live() {
            return Err(self.terminated());
        }
        let Some(attachment) = self.pty.get() else {
            return Err(WharfError::conflict(format!(
                "session {} is not attached yet",
                self.id
            )));
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(self.terminated()),
            result = attachment.input.send(data) => match result {
                Ok(()) => {
                    self.mark_active();
                    Ok(())
                }
                Err(_) => Err(self.terminated()),
            },
        }
    }

    fn resize(&self, size: TerminalSize) -> WharfResult<()> {
        if !self.status().is_live() {
            return Err(self.terminated());
        }
        let Some(attachment) = self.pty.get() else {
            return Err(WharfError::conflict(format!(
                "session {} is not attached yet",
                self.id
            )));
        };
        attachment.control.resize(size)?;
        self.touch();
        Ok(())
    }
}

/// Write half of a terminal: client input and resizes. Cheap to clone.
#[derive(Clone)]
pub struct TerminalInput {
    session: Arc<Session>,
}

impl TerminalInput {
    pub fn session_id(&self) -> &str {
        &self.session.id
    }

    /// Send client bytes to the PTY.
    ///
    /// Fails with [`WharfError::SessionTerminated`] once the session is
    /// closing or closed; such writes are dropped.
    pub async fn send(&self, data: impl Into<Bytes>) -> WharfResult<()> {
        self.session.send(data.into()).await
    }

    pub fn resize(&self, size: TerminalSize) -> WharfResult<()> {
        self.session.resize(size)
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }
}

impl std::fmt::Debug for TerminalInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalInput")
            .field("session_id", &self.session.id)
            .field("status", &self.session.status())
            .finish()
    }
}

/// Read half of a terminal: PTY output as produced, without extra buffering.
pub struct TerminalOutput {
    session: Arc<Session>,
    output: mpsc::Receiver<Bytes>,
}

impl TerminalOutput {
    /// Next chunk of PTY output; `None` once the session is closing or the
    /// process is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            biased;
            _ = self.session.cancel.cancelled() => None,
            chunk = self.output.recv() => {
                if chunk.is_some() {
                    self.session.mark_active();
                }
                chunk
            }
        }
    }
}

impl std::fmt::Debug for TerminalOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalOutput")
            .field("session_id", &self.session.id)
            .finish_non_exhaustive()
    }
}

/// Duplex byte stream of an open terminal session.
pub struct TerminalStream {
    input: TerminalInput,
    output: TerminalOutput,
}

impl std::fmt::Debug for TerminalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalStream")
            .field("session_id", &self.input.session.id)
            .field("status", &self.input.session.status())
            .finish_non_exhaustive()
    }
}

impl TerminalStream {
    pub(crate) fn new(session: Arc<Session>, output: mpsc::Receiver<Bytes>) -> Self {
        Self {
            input: TerminalInput {
                session: Arc::clone(&session),
            },
            output: TerminalOutput { session, output },
        }
    }

    pub fn session_id(&self) -> &str {
        self.input.session_id()
    }

    pub fn info(&self) -> TerminalSessionInfo {
        self.input.session.info()
    }

    pub async fn send(&self, data: impl Into<Bytes>) -> WharfResult<()> {
        self.input.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.output.recv().await
    }

    pub fn resize(&self, size: TerminalSize) -> WharfResult<()> {
        self.input.resize(size)
    }

    /// Split into independently owned halves, e.g. for separate reader and
    /// writer tasks.
    pub fn split(self) -> (TerminalInput, TerminalOutput) {
        (self.input, self.output)
    }
}

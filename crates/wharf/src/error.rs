//! Core error taxonomy.
//!
//! Every failure surfaced by the managers carries one of a closed set of
//! kinds plus a human-readable detail. Callers dispatch on [`ErrorKind`];
//! they never need to know which layer produced the error.

use log::warn;
use serde::Serialize;
use thiserror::Error;

use crate::runtime::RuntimeError;

/// Result type for core operations.
pub type WharfResult<T> = Result<T, WharfError>;

/// Error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Permission,
    Quota,
    Infrastructure,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::Permission => write!(f, "permission"),
            ErrorKind::Quota => write!(f, "quota"),
            ErrorKind::Infrastructure => write!(f, "infrastructure"),
        }
    }
}

/// A list of validation violations, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Violations(pub Vec<String>);

impl Violations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    /// Turn the collected violations into a result.
    pub fn into_result(self) -> WharfResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(WharfError::Validation(self))
        }
    }
}

impl std::fmt::Display for Violations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

/// Errors returned by the container, terminal and port managers.
#[derive(Debug, Error)]
pub enum WharfError {
    #[error("invalid request: {0}")]
    Validation(Violations),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A write or control message reached a session that is closing or closed.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("terminal session quota exceeded for user {user_id} (limit {limit})")]
    QuotaExceeded { user_id: String, limit: i64 },

    #[error("host port pool exhausted ({0})")]
    PortPoolExhausted(String),

    /// The daemon could not be reached after all retries.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl WharfError {
    pub fn validation(msg: impl Into<String>) -> Self {
        let mut violations = Violations::new();
        violations.push(msg);
        Self::Validation(violations)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn infrastructure(msg: impl Into<String>) -> Self {
        Self::Infrastructure(msg.into())
    }

    /// Wrap a persistence failure.
    pub fn store(err: anyhow::Error) -> Self {
        Self::Infrastructure(format!("store: {err:#}"))
    }

    /// The category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) | Self::SessionTerminated(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::PermissionDenied(_) => ErrorKind::Permission,
            Self::QuotaExceeded { .. } => ErrorKind::Quota,
            Self::PortPoolExhausted(_) | Self::Unavailable(_) | Self::Infrastructure(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Stable machine-readable code for the presentation layer.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Conflict(_) => "CONFLICT",
            Self::SessionTerminated(_) => "SESSION_TERMINATED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::PortPoolExhausted(_) => "PORT_POOL_EXHAUSTED",
            Self::Unavailable(_) => "SERVICE_UNAVAILABLE",
            Self::Infrastructure(_) => "INFRASTRUCTURE_ERROR",
        }
    }

    /// Prefix the detail with context (e.g. which container) without
    /// changing the kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            Self::Validation(v) => Self::Validation(v),
            Self::Conflict(m) => Self::Conflict(format!("{ctx}: {m}")),
            Self::SessionTerminated(m) => Self::SessionTerminated(format!("{ctx}: {m}")),
            Self::NotFound(m) => Self::NotFound(format!("{ctx}: {m}")),
            Self::PermissionDenied(m) => Self::PermissionDenied(format!("{ctx}: {m}")),
            e @ Self::QuotaExceeded { .. } => e,
            Self::PortPoolExhausted(m) => Self::PortPoolExhausted(format!("{ctx}: {m}")),
            Self::Unavailable(m) => Self::Unavailable(format!("{ctx}: {m}")),
            Self::Infrastructure(m) => Self::Infrastructure(format!("{ctx}: {m}")),
        }
    }
}

impl From<RuntimeError> for WharfError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Rejected(msg) | RuntimeError::InvalidInput(msg) => {
                WharfError::validation(msg)
            }
            RuntimeError::Conflict(msg) => WharfError::Conflict(msg),
            RuntimeError::NotFound(msg) => WharfError::NotFound(msg),
            // Raw daemon output (socket paths, stderr) stays in the logs.
            RuntimeError::Unavailable(msg) => {
                warn!("container runtime unreachable: {}", msg);
                WharfError::Unavailable("container runtime is unreachable".to_string())
            }
            RuntimeError::Timeout { command, after } => WharfError::Unavailable(format!(
                "container runtime did not answer {command} within {after:?}"
            )),
            RuntimeError::CommandFailed { command, message } => {
                warn!("container runtime {} failed: {}", command, message);
                WharfError::Infrastructure(format!("container runtime {command} failed"))
            }
            RuntimeError::Pty(msg) => {
                WharfError::Infrastructure(format!("terminal spawn failed: {msg}"))
            }
            RuntimeError::Parse(_) => {
                WharfError::Infrastructure("unexpected container runtime output".to_string())
            }
            RuntimeError::Io(e) => WharfError::Infrastructure(format!("io error: {e}")),
        }
    }
}

//! Container runtime error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for container runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur while talking to the container daemon.
///
/// Raw daemon failures are classified into these variants before they leave
/// the adapter.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon could not be reached (socket refused, binary missing, ...).
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),

    /// The daemon did not answer within the call timeout.
    #[error("container runtime {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// The daemon reported a name or state conflict.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Container (or image) was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The daemon rejected the request as invalid (bad image, resource over-commit).
    #[error("rejected by container runtime: {0}")]
    Rejected(String),

    /// Invalid input caught before reaching the daemon.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The container command failed for an unclassified reason.
    #[error("container {command} failed: {message}")]
    CommandFailed { command: String, message: String },

    /// Allocating or spawning the pseudo-terminal failed.
    #[error("pty error: {0}")]
    Pty(String),

    /// Failed to parse container output.
    #[error("failed to parse container output: {0}")]
    Parse(String),

    /// Generic IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether retrying the same call may succeed.
    ///
    /// Only connectivity failures qualify.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Classify a failed CLI invocation by its stderr output.
pub(crate) fn classify_failure(command: &str, stderr: &str) -> RuntimeError {
    let message = stderr.trim().to_string();
    let lower = message.to_lowercase();

    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("connection refused")
        || lower.contains("is the docker daemon running")
        || lower.contains("unable to connect to podman")
        || lower.contains("no such file or directory") && lower.contains(".sock")
    {
        RuntimeError::Unavailable(message)
    } else if lower.contains("is already in use")
        || lower.contains("conflict")
        || lower.contains("already exists")
    {
        RuntimeError::Conflict(message)
    } else if lower.contains("no such image")
        || lower.contains("unable to find image")
        || lower.contains("invalid reference format")
        || lower.contains("repository does not exist")
        || lower.contains("pull access denied")
        || lower.contains("range of cpus")
        || lower.contains("minimum memory limit")
        || lower.contains("insufficient")
    {
        RuntimeError::Rejected(message)
    } else if lower.contains("no such container") || lower.contains("no container with") {
        RuntimeError::NotFound(message)
    } else {
        RuntimeError::CommandFailed {
            command: command.to_string(),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_unreachable_daemon() {
        let err = classify_failure(
            "create",
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?",
        );
        assert!(matches!(err, RuntimeError::Unavailable(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_classify_name_conflict() {
        let err = classify_failure(
            "create",
            "Error response from daemon: Conflict. The container name \"/ws\" is already in use by container \"abc\".",
        );
        assert!(matches!(err, RuntimeError::Conflict(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_classify_bad_image() {
        let err = classify_failure("create", "Unable to find image 'nope:latest' locally");
        assert!(matches!(err, RuntimeError::Rejected(_)));
    }

    #[test]
    fn test_classify_missing_container() {
        let err = classify_failure("stop", "Error: No such container: deadbeef");
        assert!(matches!(err, RuntimeError::NotFound(_)));
    }

    #[test]
    fn test_classify_unknown_failure() {
        let err = classify_failure("start", "something odd happened");
        assert!(matches!(err, RuntimeError::CommandFailed { .. }));
        assert!(!err.is_transient());
    }
}

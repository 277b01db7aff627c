//! Container data models.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ports::PortMapping;
use crate::resources::{DeclaredPort, ResourceRequest, ResourceSpec};

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Daemon create/start in flight.
    Creating,
    Running,
    Stopped,
    /// Teardown in progress; no further mutation is accepted.
    Removing,
    /// An unrecoverable daemon failure; may be started, stopped or removed.
    Error,
}

impl ContainerStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-entering the current state is always allowed so reconciliation
    /// can apply the same observation twice.
    pub fn can_transition_to(self, next: ContainerStatus) -> bool {
        use ContainerStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Running | Removing | Error)
                | (Running, Stopped | Removing | Error)
                | (Stopped, Running | Removing | Error)
                | (Error, Running | Stopped | Removing)
                | (Removing, Error)
        )
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerStatus::Creating => write!(f, "creating"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Stopped => write!(f, "stopped"),
            ContainerStatus::Removing => write!(f, "removing"),
            ContainerStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creating" => Ok(ContainerStatus::Creating),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "removing" => Ok(ContainerStatus::Removing),
            "error" => Ok(ContainerStatus::Error),
            _ => Err(format!("unknown container status: {}", s)),
        }
    }
}

impl TryFrom<String> for ContainerStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

/// A managed container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Daemon-assigned id.
    pub id: String,
    /// Unique among containers that have not been removed.
    pub name: String,
    pub image: String,
    pub owner_id: String,
    pub status: ContainerStatus,
    pub resources: ResourceSpec,
    /// Ports declared at creation; forwarded while the container runs.
    pub declared_ports: Vec<DeclaredPort>,
    /// Active forwards (filled in when the container is read).
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub image: String,
    pub resources: ResourceRequest,
    /// Overrides the image's default command.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl CreateContainerRequest {
    pub fn new(name: impl Into<String>, image: impl Into<String>, resources: ResourceRequest) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            resources,
            command: Vec::new(),
            env: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ContainerStatus::*;

    #[test]
    fn test_status_transitions() {
        assert!(Creating.can_transition_to(Running));
        assert!(Running.can_transition_to(Stopped));
        assert!(Stopped.can_transition_to(Running));
        assert!(Error.can_transition_to(Removing));
        assert!(Running.can_transition_to(Running));

        assert!(!Removing.can_transition_to(Running));
        assert!(!Removing.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Creating));
        assert!(!Creating.can_transition_to(Stopped));
    }

    #[test]
    fn test_status_from_stored_string() {
        use super::ContainerStatus;

        assert_eq!(ContainerStatus::try_from("error".to_string()), Ok(Error));
        assert_eq!(ContainerStatus::try_from("Running".to_string()), Ok(Running));
        assert!(ContainerStatus::try_from("paused".to_string()).is_err());
    }
}

//! Permission checks.
//!
//! Managers ask a [`PermissionGate`] before touching the daemon. Storage of
//! roles and grants lives outside this crate; [`RoleGate`] is a small
//! built-in implementation driven by the configured role table.

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::PermissionSettings;
use crate::error::{WharfError, WharfResult};

/// User role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
    /// Automation account: acts on any workspace but cannot change quotas.
    Service,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Admin => write!(f, "admin"),
            Role::Service => write!(f, "service"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            "service" => Ok(Role::Service),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Something a user wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CreateContainer,
    ViewContainer,
    StartContainer,
    StopContainer,
    RemoveContainer,
    OpenTerminal,
    ViewTerminal,
    CloseTerminal,
    ForwardPort,
    ViewPorts,
    UnforwardPort,
    ManageQuota,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::CreateContainer => "create_container",
            Action::ViewContainer => "view_container",
            Action::StartContainer => "start_container",
            Action::StopContainer => "stop_container",
            Action::RemoveContainer => "remove_container",
            Action::OpenTerminal => "open_terminal",
            Action::ViewTerminal => "view_terminal",
            Action::CloseTerminal => "close_terminal",
            Action::ForwardPort => "forward_port",
            Action::ViewPorts => "view_ports",
            Action::UnforwardPort => "unforward_port",
            Action::ManageQuota => "manage_quota",
        };
        f.write_str(name)
    }
}

/// Kind of resource an action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Container,
    TerminalSession,
    PortMapping,
    Quota,
}

/// The resource an action targets.
///
/// `owner` is the user the resource belongs to; it is `None` for resources
/// that do not exist (yet, or any more).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub id: Option<String>,
    pub owner: Option<String>,
}

impl ResourceRef {
    /// A container that is about to be created.
    pub fn new_container() -> Self {
        Self {
            kind: ResourceKind::Container,
            id: None,
            owner: None,
        }
    }

    pub fn container(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Container,
            id: Some(id.into()),
            owner: Some(owner.into()),
        }
    }

    pub fn session(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::TerminalSession,
            id: Some(id.into()),
            owner: Some(owner.into()),
        }
    }

    pub fn mapping(id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::PortMapping,
            id: Some(id.into()),
            owner: Some(owner.into()),
        }
    }

    /// A port mapping that is no longer active.
    pub fn released_mapping(id: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::PortMapping,
            id: Some(id.into()),
            owner: None,
        }
    }

    /// Quota settings of a user (`None` for the deployment default).
    pub fn quota(user_id: Option<&str>) -> Self {
        Self {
            kind: ResourceKind::Quota,
            id: user_id.map(str::to_string),
            owner: None,
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Authorizes actions on behalf of users.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn authorize(&self, user_id: &str, action: Action, resource: &ResourceRef) -> Decision;
}

/// Ask `gate` and turn a denial into [`WharfError::PermissionDenied`].
pub async fn require(
    gate: &dyn PermissionGate,
    user_id: &str,
    action: Action,
    resource: &ResourceRef,
) -> WharfResult<()> {
    match gate.authorize(user_id, action, resource).await {
        Decision::Allowed => Ok(()),
        Decision::Denied(reason) => {
            debug!("denied {} for user {}: {}", action, user_id, reason);
            Err(WharfError::PermissionDenied(format!("{action}: {reason}")))
        }
    }
}

/// Role-based gate.
///
/// Admins may do anything. Service accounts may act on any workspace but
/// not change quotas. Users may create workspaces and act on resources they
/// own.
#[derive(Debug, Clone, Default)]
pub struct RoleGate {
    roles: HashMap<String, Role>,
    default_role: Role,
}

impl RoleGate {
    pub fn new(default_role: Role) -> Self {
        Self {
            roles: HashMap::new(),
            default_role,
        }
    }

    pub fn from_settings(settings: &PermissionSettings) -> Self {
        Self {
            roles: settings.users.clone(),
            default_role: settings.default_role.unwrap_or_default(),
        }
    }

    pub fn with_role(mut self, user_id: impl Into<String>, role: Role) -> Self {
        self.roles.insert(user_id.into(), role);
        self
    }

    pub fn role_of(&self, user_id: &str) -> Role {
        self.roles
            .get(user_id)
            .copied()
            .unwrap_or(self.default_role)
    }
}

#[async_trait]
impl PermissionGate for RoleGate {
    async fn authorize(&self, user_id: &str, action: Action, resource: &ResourceRef) -> Decision {
        match (self.role_of(user_id), action) {
            (Role::Admin, _) => Decision::Allowed,
            (_, Action::ManageQuota) => Decision::Denied("requires admin role".to_string()),
            (Role::Service, _) => Decision::Allowed,
            (Role::User, _) => match resource.owner.as_deref() {
                None => Decision::Allowed,
                Some(owner) if owner == user_id => Decision::Allowed,
                Some(_) => Decision::Denied("resource belongs to another user".to_string()),
            },
        }
    }
}

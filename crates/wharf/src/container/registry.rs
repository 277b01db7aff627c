//! In-memory container state shared by the managers.

use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::OwnedMutexGuard;

use super::models::{Container, ContainerStatus};
use crate::error::{WharfError, WharfResult};
use crate::sync::KeyedLocks;

/// Authoritative local view of managed containers.
///
/// Reads are lock-free snapshots. Lifecycle mutations of one container are
/// serialized through [`ContainerRegistry::lock`]; creates of one name
/// through [`ContainerRegistry::lock_name`].
#[derive(Debug, Default)]
pub struct ContainerRegistry {
    records: DashMap<String, Container>,
    /// name -> id of every container that has not been removed.
    names: DashMap<String, String>,
    locks: KeyedLocks,
    name_locks: KeyedLocks,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive lifecycle access to one container.
    pub async fn lock(&self, id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(id).await
    }

    /// Exclusive access to a container name while it is being claimed.
    pub async fn lock_name(&self, name: &str) -> OwnedMutexGuard<()> {
        self.name_locks.lock(name).await
    }

    /// Drop unused lock entries once the caller's guard is gone.
    pub(crate) fn prune_locks(&self, id: Option<&str>, name: Option<&str>) {
        if let Some(id) = id
            && !self.records.contains_key(id)
        {
            self.locks.forget(id);
        }
        if let Some(name) = name {
            self.name_locks.forget(name);
        }
    }

    pub fn get(&self, id: &str) -> Option<Container> {
        self.records.get(id).map(|c| c.clone())
    }

    pub fn status(&self, id: &str) -> Option<ContainerStatus> {
        self.records.get(id).map(|c| c.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn name_taken(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    pub fn list(&self) -> Vec<Container> {
        let mut containers: Vec<Container> = self.records.iter().map(|c| c.clone()).collect();
        containers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        containers
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Register a container. Fails if its name is held by another container.
    pub fn insert(&self, container: Container) -> WharfResult<()> {
        match self.names.entry(container.name.clone()) {
            Entry::Occupied(entry) if entry.get() != &container.id => {
                return Err(WharfError::conflict(format!(
                    "container name '{}' is already in use",
                    container.name
                )));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(container.id.clone());
            }
        }
        self.records.insert(container.id.clone(), container);
        Ok(())
    }

    /// Move a container to `next`, enforcing the state machine.
    ///
    /// Returns the updated snapshot.
    pub fn transition(
        &self,
        id: &str,
        next: ContainerStatus,
        error_message: Option<String>,
    ) -> WharfResult<Container> {
        let mut record = self
            .records
            .get_mut(id)
            .ok_or_else(|| WharfError::not_found(format!("container {id}")))?;
        if !record.status.can_transition_to(next) {
            return Err(WharfError::conflict(format!(
                "container {id} cannot move from {} to {next}",
                record.status
            )));
        }
        record.status = next;
        record.error_message = error_message;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    /// Drop a container from the registry and free its name.
    pub fn remove(&self, id: &str) -> Option<Container> {
        let (_, container) = self.records.remove(id)?;
        self.names
            .remove_if(&container.name, |_, owner| owner == &container.id);
        Some(container)
    }
}

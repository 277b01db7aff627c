//! Container lifecycle.
//!
//! [`ContainerManager`] is the entry point for create/start/stop/remove,
//! port forwarding requests and daemon reconciliation. The
//! [`ContainerRegistry`] holds the in-memory state it shares with the
//! terminal manager; [`ContainerStore`] persists it.

mod manager;
mod models;
mod registry;
mod repository;

pub use manager::{ContainerManager, RestoreReport};
pub use models::{Container, ContainerStatus, CreateContainerRequest};
pub use registry::ContainerRegistry;
pub use repository::{ContainerStore, SqliteContainerStore};

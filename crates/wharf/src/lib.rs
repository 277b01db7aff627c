//! Containerized workspaces with interactive terminals and port forwarding.
//!
//! The crate is organized around three managers sharing one container
//! registry:
//!
//! - [`container::ContainerManager`] drives the container lifecycle and
//!   reconciles it against daemon events.
//! - [`terminal::TerminalSessionManager`] opens PTY sessions inside running
//!   containers under per-user quotas.
//! - [`ports::PortForwardingManager`] relays host ports into containers.
//!
//! [`Wharf`] assembles them from a runtime, a store and a permission gate.

pub mod app;
pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod permissions;
pub mod ports;
pub mod resources;
pub mod retry;
pub mod runtime;
pub mod sync;
pub mod terminal;

pub use app::Wharf;
pub use config::WharfConfig;
pub use error::{ErrorKind, WharfError, WharfResult};

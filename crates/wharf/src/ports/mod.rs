//! Host port forwarding.
//!
//! [`PortForwardingManager`] owns the host port pool and one relay per
//! active mapping. Authorization and container state checks happen in
//! [`crate::container::ContainerManager`], which is the public entry point for
//! forwarding requests.

mod allocator;
mod proxy;

pub use allocator::PortAllocator;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::PortSettings;
use crate::container::ContainerStore;
use crate::error::{WharfError, WharfResult};
use crate::resources::Protocol;
use crate::retry::DaemonPolicy;
use crate::runtime::{ContainerRuntimeApi, DaemonState};

use proxy::{Listener, ProxyHandle};

/// An active host port forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub container_id: String,
    pub container_port: u16,
    /// Unique among active mappings.
    pub host_port: u16,
    pub protocol: Protocol,
    pub created_at: DateTime<Utc>,
}

struct ActiveForward {
    mapping: PortMapping,
    proxy: ProxyHandle,
}

/// Allocates host ports and relays their traffic into containers.
pub struct PortForwardingManager {
    runtime: Arc<dyn ContainerRuntimeApi>,
    policy: DaemonPolicy,
    store: Arc<dyn ContainerStore>,
    allocator: PortAllocator,
    bind_address: IpAddr,
    connect_timeout: Duration,
    active: DashMap<String, ActiveForward>,
}

impl PortForwardingManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntimeApi>,
        policy: DaemonPolicy,
        store: Arc<dyn ContainerStore>,
        settings: &PortSettings,
    ) -> WharfResult<Self> {
        let bind_address: IpAddr = settings.bind_address.parse().map_err(|_| {
            WharfError::validation(format!("invalid bind address {}", settings.bind_address))
        })?;
        if settings.range_start == 0 || settings.range_start > settings.range_end {
            return Err(WharfError::validation(format!(
                "invalid host port range {}-{}",
                settings.range_start, settings.range_end
            )));
        }
        Ok(Self {
            runtime,
            policy,
            store,
            allocator: PortAllocator::new(settings.range_start..=settings.range_end),
            bind_address,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs.max(1)),
            active: DashMap::new(),
        })
    }

    /// Forward a free host port to `container_port` of a running container.
    pub async fn forward(
        &self,
        container_id: &str,
        container_port: u16,
        protocol: Protocol,
    ) -> WharfResult<PortMapping> {
        let id = uuid::Uuid::new_v4().to_string();
        self.establish(id, container_id, container_port, protocol, None)
            .await
    }

    /// Re-create a persisted mapping, keeping its id and, when still free,
    /// its host port.
    pub async fn restore(&self, previous: &PortMapping) -> WharfResult<PortMapping> {
        self.establish(
            previous.id.clone(),
            &previous.container_id,
            previous.container_port,
            previous.protocol,
            Some(previous.host_port),
        )
        .await
    }

    async fn establish(
        &self,
        id: String,
        container_id: &str,
        container_port: u16,
        protocol: Protocol,
        preferred_host_port: Option<u16>,
    ) -> WharfResult<PortMapping> {
        if container_port == 0 {
            return Err(WharfError::validation("container port 0 is out of range 1-65535"));
        }
        if self
            .active
            .iter()
            .any(|f| {
                f.mapping.container_id == container_id
                    && f.mapping.container_port == container_port
                    && f.mapping.protocol == protocol
            })
        {
            return Err(WharfError::conflict(format!(
                "port {container_port}/{protocol} of container {container_id} is already forwarded"
            )));
        }

        let upstream_ip = self.container_address(container_id).await?;
        let upstream = SocketAddr::new(upstream_ip, container_port);
        let (host_port, listener) = self.bind_host_port(protocol, preferred_host_port).await?;

        let mapping = PortMapping {
            id,
            container_id: container_id.to_string(),
            container_port,
            host_port,
            protocol,
            created_at: Utc::now(),
        };
        let proxy = proxy::spawn(listener, upstream, self.connect_timeout);

        if let Err(e) = self.store.save_mapping(&mapping).await {
            proxy.shutdown().await;
            self.allocator.release(host_port);
            return Err(WharfError::store(e));
        }

        info!(
            "forwarding {}:{}/{} -> container {} ({}) port {}",
            self.bind_address, host_port, protocol, container_id, upstream_ip, container_port
        );
        self.active.insert(
            mapping.id.clone(),
            ActiveForward {
                mapping: mapping.clone(),
                proxy,
            },
        );
        Ok(mapping)
    }

    /// Runs with the container lock held by the caller, so a single attempt.
    async fn container_address(&self, container_id: &str) -> WharfResult<IpAddr> {
        let inspect = self
            .policy
            .once("inspect", self.runtime.inspect_container(container_id))
            .await
            .map_err(|e| WharfError::from(e).context(format!("container {container_id}")))?
            .ok_or_else(|| WharfError::not_found(format!("container {container_id}")))?;
        if inspect.state != DaemonState::Running {
            return Err(WharfError::conflict(format!(
                "container {container_id} is not running"
            )));
        }
        inspect.ip_address.ok_or_else(|| {
            WharfError::conflict(format!("container {container_id} has no network address"))
        })
    }

    /// Take a host port from the pool and bind it, skipping ports some other
    /// process already holds.
    async fn bind_host_port(
        &self,
        protocol: Protocol,
        preferred: Option<u16>,
    ) -> WharfResult<(u16, Listener)> {
        if let Some(port) = preferred
            && self.allocator.reserve(port)
        {
            match Listener::bind(protocol, SocketAddr::new(self.bind_address, port)).await {
                Ok(listener) => return Ok((port, listener)),
                Err(e) => {
                    debug!("preferred host port {} unavailable: {}", port, e);
                    self.allocator.release(port);
                }
            }
        }

        let mut skipped = Vec::new();
        let result = loop {
            let Some(port) = self.allocator.allocate() else {
                let range = self.allocator.range();
                break Err(WharfError::PortPoolExhausted(format!(
                    "no free host port in {}-{}",
                    range.start(),
                    range.end()
                )));
            };
            match Listener::bind(protocol, SocketAddr::new(self.bind_address, port)).await {
                Ok(listener) => break Ok((port, listener)),
                Err(e) => {
                    debug!("host port {} unavailable: {}", port, e);
                    // Held until the search ends so the pool does not hand it out again.
                    skipped.push(port);
                }
            }
        };
        for port in skipped {
            self.allocator.release(port);
        }
        result
    }

    /// Tear down a mapping and return its port to the pool.
    ///
    /// Returns `Ok(false)` when the mapping was already released.
    pub async fn unforward(&self, mapping_id: &str) -> WharfResult<bool> {
        Ok(self.release(mapping_id, true).await)
    }

    /// The one release path: whoever removes the entry closes the relay, and
    /// the port goes back to the pool only after the listener is gone.
    async fn release(&self, mapping_id: &str, forget: bool) -> bool {
        let Some((_, forward)) = self.active.remove(mapping_id) else {
            debug!("mapping {} already released", mapping_id);
            return false;
        };
        let mapping = forward.mapping;
        forward.proxy.shutdown().await;
        self.allocator.release(mapping.host_port);
        info!(
            "released host port {}/{} of container {}",
            mapping.host_port, mapping.protocol, mapping.container_id
        );

        if forget && let Err(e) = self.store.delete_mapping(&mapping.id).await {
            warn!("failed to delete mapping {} from store: {:#}", mapping.id, e);
        }
        true
    }

    /// Release every mapping of a container. Returns how many were released.
    pub async fn release_container(&self, container_id: &str) -> usize {
        let ids: Vec<String> = self
            .active
            .iter()
            .filter(|f| f.mapping.container_id == container_id)
            .map(|f| f.key().clone())
            .collect();
        let mut released = 0;
        for id in ids {
            if self.release(&id, true).await {
                released += 1;
            }
        }
        released
    }

    /// Active mappings of a container, ordered by host port.
    pub fn list(&self, container_id: &str) -> Vec<PortMapping> {
        let mut mappings: Vec<PortMapping> = self
            .active
            .iter()
            .filter(|f| f.mapping.container_id == container_id)
            .map(|f| f.mapping.clone())
            .collect();
        mappings.sort_by_key(|m| m.host_port);
        mappings
    }

    pub fn get(&self, mapping_id: &str) -> Option<PortMapping> {
        self.active.get(mapping_id).map(|f| f.mapping.clone())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Close every relay (service shutdown). Persisted mappings are kept so
    /// they can be restored on the next start.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.active.iter().map(|f| f.key().clone()).collect();
        for id in ids {
            self.release(&id, false).await;
        }
    }

    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }
}

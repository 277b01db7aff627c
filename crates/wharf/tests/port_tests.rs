//! Port forwarding integration tests.
//!
//! The fake runtime reports 127.0.0.1 for every container, so a local echo
//! server stands in for the service inside the container.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wharf::Wharf;
use wharf::container::ContainerStore;
use wharf::error::ErrorKind;
use wharf::permissions::{Action, Decision, PermissionGate, ResourceRef};
use wharf::resources::Protocol;

mod common;
use common::*;

/// Spawn a TCP echo server and return its port.
async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

async fn roundtrip(host_port: u16, payload: &[u8]) -> Vec<u8> {
    let addr = SocketAddr::from(([127, 0, 0, 1], host_port));
    let mut stream = tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(addr))
        .await
        .unwrap()
        .unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(2), stream.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf
}

#[tokio::test]
async fn test_declared_ports_are_forwarded_on_create() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();

    assert_eq!(container.port_mappings.len(), 1);
    let mapping = &container.port_mappings[0];
    assert_eq!(mapping.container_port, upstream);
    assert_eq!(mapping.protocol, Protocol::Tcp);
    assert!(
        (env.config.ports.range_start..=env.config.ports.range_end).contains(&mapping.host_port)
    );

    assert_eq!(roundtrip(mapping.host_port, b"ping").await, b"ping");
    assert_eq!(env.store.load_mappings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unforward_twice_is_a_noop() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();
    let mapping = container.port_mappings[0].clone();
    let containers = &env.wharf.containers;

    let err = containers
        .unforward_port(BOB, &mapping.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    assert!(containers.unforward_port(ALICE, &mapping.id).await.unwrap());
    assert!(!containers.unforward_port(ALICE, &mapping.id).await.unwrap());
    assert!(!env.wharf.ports.allocator().is_allocated(mapping.host_port));
    assert!(env.store.load_mappings().await.unwrap().is_empty());

    let addr = SocketAddr::from(([127, 0, 0, 1], mapping.host_port));
    assert!(TcpStream::connect(addr).await.is_err());

    // The declared port can be forwarded again.
    let again = containers
        .forward_port(ALICE, &container.id, upstream, Protocol::Tcp)
        .await
        .unwrap();
    assert_eq!(roundtrip(again.host_port, b"again").await, b"again");
}

/// Lets users do everything they normally could, except release forwards.
struct NoUnforward;

#[async_trait]
impl PermissionGate for NoUnforward {
    async fn authorize(&self, user_id: &str, action: Action, resource: &ResourceRef) -> Decision {
        if action == Action::UnforwardPort {
            return Decision::Denied("forwards are managed by operators".to_string());
        }
        test_gate().authorize(user_id, action, resource).await
    }
}

#[tokio::test]
async fn test_unforward_consults_gate_for_released_mappings() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();
    let mapping_id = container.port_mappings[0].id.clone();
    env.wharf.shutdown().await;

    let restricted = Wharf::new(
        env.runtime.clone(),
        env.store.clone(),
        Arc::new(NoUnforward),
        &env.config,
    )
    .unwrap();
    restricted.containers.restore().await.unwrap();

    let err = restricted
        .containers
        .unforward_port(ALICE, &mapping_id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    let err = restricted
        .containers
        .unforward_port(ALICE, "no-such-mapping")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(restricted.ports.list(&container.id).len(), 1);
}

#[tokio::test]
async fn test_host_port_is_reusable_only_after_release() {
    let mut config = test_config();
    config.ports.range_end = config.ports.range_start;
    let env = test_env_with(config).await;
    let first_upstream = echo_server().await;
    let second_upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(
            ALICE,
            create_request_with_ports(
                "web",
                &[u32::from(first_upstream), u32::from(second_upstream)],
            ),
        )
        .await
        .unwrap();
    // Only one port in the pool: the second declared port is not forwarded.
    assert_eq!(container.port_mappings.len(), 1);
    let held = container.port_mappings[0].clone();
    let containers = &env.wharf.containers;

    let err = containers
        .forward_port(ALICE, &container.id, second_upstream, Protocol::Tcp)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "PORT_POOL_EXHAUSTED");
    assert_eq!(err.kind(), ErrorKind::Infrastructure);

    containers.unforward_port(ALICE, &held.id).await.unwrap();
    let mapping = containers
        .forward_port(ALICE, &container.id, second_upstream, Protocol::Tcp)
        .await
        .unwrap();
    assert_eq!(mapping.host_port, held.host_port);
}

#[tokio::test]
async fn test_forward_requires_declared_port_and_running_container() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();
    let containers = &env.wharf.containers;

    let err = containers
        .forward_port(ALICE, &container.id, 9999, Protocol::Tcp)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = containers
        .forward_port(ALICE, &container.id, upstream, Protocol::Tcp)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    containers.stop(ALICE, &container.id).await.unwrap();
    let err = containers
        .forward_port(ALICE, &container.id, upstream, Protocol::Tcp)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_stop_releases_and_start_restores_forwards() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();
    let containers = &env.wharf.containers;

    let stopped = containers.stop(ALICE, &container.id).await.unwrap();
    assert!(stopped.port_mappings.is_empty());
    assert_eq!(env.wharf.ports.active_count(), 0);
    assert_eq!(env.wharf.ports.allocator().in_use(), 0);

    let started = containers.start(ALICE, &container.id).await.unwrap();
    assert_eq!(started.port_mappings.len(), 1);
    assert_eq!(
        roundtrip(started.port_mappings[0].host_port, b"back").await,
        b"back"
    );
}

#[tokio::test]
async fn test_remove_releases_every_mapping() {
    let env = test_env().await;
    let first = echo_server().await;
    let second = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(
            ALICE,
            create_request_with_ports("web", &[u32::from(first), u32::from(second)]),
        )
        .await
        .unwrap();
    assert_eq!(container.port_mappings.len(), 2);

    env.wharf
        .containers
        .remove(ALICE, &container.id)
        .await
        .unwrap();

    assert_eq!(env.wharf.ports.active_count(), 0);
    assert_eq!(env.wharf.ports.allocator().in_use(), 0);
    assert!(env.store.load_mappings().await.unwrap().is_empty());
    for mapping in &container.port_mappings {
        let addr = SocketAddr::from(([127, 0, 0, 1], mapping.host_port));
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

#[tokio::test]
async fn test_restore_keeps_mapping_identity() {
    let env = test_env().await;
    let upstream = echo_server().await;
    let container = env
        .wharf
        .containers
        .create(ALICE, create_request_with_ports("web", &[u32::from(upstream)]))
        .await
        .unwrap();
    let before = container.port_mappings[0].clone();

    env.wharf.shutdown().await;
    assert_eq!(env.store.load_mappings().await.unwrap().len(), 1);

    let restarted = Wharf::new(
        env.runtime.clone(),
        env.store.clone(),
        Arc::new(test_gate()),
        &env.config,
    )
    .unwrap();
    let report = restarted.containers.restore().await.unwrap();
    assert_eq!(report.containers, 1);
    assert_eq!(report.forwards, 1);

    let after = restarted.ports.list(&container.id);
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].id, before.id);
    assert_eq!(after[0].host_port, before.host_port);
    assert_eq!(roundtrip(after[0].host_port, b"hello").await, b"hello");
}

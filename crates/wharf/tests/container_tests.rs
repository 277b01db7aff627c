//! Container lifecycle integration tests.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use wharf::Wharf;
use wharf::container::{ContainerStatus, ContainerStore};
use wharf::error::ErrorKind;
use wharf::runtime::fake::{FakeFailure, FakeOp};
use wharf::runtime::{DaemonState, MANAGED_LABEL, OWNER_LABEL};

mod common;
use common::*;

#[tokio::test]
async fn test_create_starts_and_persists_container() {
    let env = test_env().await;
    let container = env.running_container(ALICE, "dev").await;

    assert_eq!(container.owner_id, ALICE);
    assert_eq!(container.resources.cpu_millis, 1000);
    assert_eq!(container.resources.memory_bytes, 512 * 1024 * 1024);
    assert_eq!(env.runtime.state_of(&container.id), Some(DaemonState::Running));

    let spec = env.runtime.spec_of(&container.id).unwrap();
    assert_eq!(spec.labels.get(OWNER_LABEL).map(String::as_str), Some(ALICE));
    assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));

    let stored = env.store.load_containers().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, ContainerStatus::Running);
}

#[tokio::test]
async fn test_concurrent_creates_with_one_name() {
    let env = test_env().await;
    let containers = &env.wharf.containers;

    let (first, second) = tokio::join!(
        containers.create(ALICE, create_request("shared")),
        containers.create(BOB, create_request("shared")),
    );

    let results = [first, second];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.kind() == ErrorKind::Conflict))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);
    assert_eq!(env.runtime.calls(FakeOp::Create), 1);
    assert_eq!(env.runtime.container_count(), 1);
}

#[tokio::test]
async fn test_invalid_request_never_reaches_daemon() {
    let env = test_env().await;
    let mut request = create_request("dev");
    request.resources.cpus = 0.4;
    request.resources.memory = "2x".to_string();

    let err = env
        .wharf
        .containers
        .create(ALICE, request)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(err.to_string().contains("cpus"));
    assert!(err.to_string().contains("memory"));
    assert_eq!(env.runtime.calls(FakeOp::Create), 0);
}

#[tokio::test]
async fn test_unreachable_daemon_is_retried() {
    let env = test_env().await;
    env.runtime.fail_next(FakeOp::Create, FakeFailure::Unavailable);
    env.runtime.fail_next(FakeOp::Create, FakeFailure::Unavailable);

    env.running_container(ALICE, "dev").await;
    assert_eq!(env.runtime.calls(FakeOp::Create), 3);
}

#[tokio::test]
async fn test_retries_give_up_with_service_unavailable() {
    let env = test_env().await;
    for _ in 0..3 {
        env.runtime.fail_next(FakeOp::Create, FakeFailure::Unavailable);
    }

    let err = env
        .wharf
        .containers
        .create(ALICE, create_request("dev"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(err.code(), "SERVICE_UNAVAILABLE");
    assert_eq!(env.runtime.calls(FakeOp::Create), 3);
}

#[tokio::test]
async fn test_daemon_rejection_is_not_retried() {
    let env = test_env().await;
    env.runtime.fail_next(
        FakeOp::Create,
        FakeFailure::Rejected("manifest unknown".to_string()),
    );

    let err = env
        .wharf
        .containers
        .create(ALICE, create_request("dev"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(env.runtime.calls(FakeOp::Create), 1);
    assert!(env.wharf.containers.registry().is_empty());
}

#[tokio::test]
async fn test_create_survives_a_lost_reply() {
    let mut config = test_config();
    config.runtime.call_timeout_secs = 1;
    let env = test_env_with(config).await;
    // The daemon creates the container but the answer never arrives; the
    // retry then runs into the container's own name.
    env.runtime.fail_next(FakeOp::Create, FakeFailure::LoseReply);

    let container = env.running_container(ALICE, "dev").await;
    assert_eq!(env.runtime.calls(FakeOp::Create), 2);
    assert_eq!(env.runtime.container_count(), 1);
    assert_eq!(env.runtime.state_of(&container.id), Some(DaemonState::Running));
    assert_eq!(env.wharf.containers.registry().len(), 1);

    let err = env
        .wharf
        .containers
        .create(ALICE, create_request("dev"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(env.runtime.container_count(), 1);

    // Once removed, the name can be used again.
    env.wharf
        .containers
        .remove(ALICE, &container.id)
        .await
        .unwrap();
    assert_eq!(env.runtime.container_count(), 0);
    env.running_container(ALICE, "dev").await;
}

#[tokio::test]
async fn test_failed_start_rolls_back() {
    let env = test_env().await;
    env.runtime.fail_next(
        FakeOp::Start,
        FakeFailure::CommandFailed("OCI runtime create failed: runc panic".to_string()),
    );

    let err = env
        .wharf
        .containers
        .create(ALICE, create_request("dev"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(!err.to_string().contains("runc panic"));

    assert_eq!(env.runtime.calls(FakeOp::Remove), 1);
    assert_eq!(env.runtime.container_count(), 0);
    assert!(env.wharf.containers.registry().is_empty());
    assert!(env.store.load_containers().await.unwrap().is_empty());

    // The name is free again.
    env.running_container(ALICE, "dev").await;
}

#[tokio::test]
async fn test_stop_and_start() {
    let env = test_env().await;
    let container = env.running_container(ALICE, "dev").await;
    let containers = &env.wharf.containers;

    let stopped = containers.stop(ALICE, &container.id).await.unwrap();
    assert_eq!(stopped.status, ContainerStatus::Stopped);
    assert_eq!(env.runtime.state_of(&container.id), Some(DaemonState::Exited));

    // Stopping again is a no-op.
    containers.stop(ALICE, &container.id).await.unwrap();
    assert_eq!(env.runtime.calls(FakeOp::Stop), 1);

    let started = containers.start(ALICE, &container.id).await.unwrap();
    assert_eq!(started.status, ContainerStatus::Running);

    let stored = env.store.load_containers().await.unwrap();
    assert_eq!(stored[0].status, ContainerStatus::Running);
}

#[tokio::test]
async fn test_failed_stop_marks_error_and_remove_recovers() {
    let env = test_env().await;
    let container = env.running_container(ALICE, "dev").await;
    env.runtime.fail_next(
        FakeOp::Stop,
        FakeFailure::CommandFailed("cgroup busy".to_string()),
    );

    let err = env
        .wharf
        .containers
        .stop(ALICE, &container.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert_eq!(env.status(&container.id), Some(ContainerStatus::Error));

    env.wharf
        .containers
        .remove(ALICE, &container.id)
        .await
        .unwrap();
    assert!(env.status(&container.id).is_none());
}

#[tokio::test]
async fn test_remove_clears_everything() {
    let env = test_env().await;
    let container = env.running_container(ALICE, "dev").await;

    env.wharf
        .containers
        .remove(ALICE, &container.id)
        .await
        .unwrap();

    assert!(env.runtime.state_of(&container.id).is_none());
    assert!(env.status(&container.id).is_none());
    assert!(env.store.load_containers().await.unwrap().is_empty());

    let err = env
        .wharf
        .containers
        .get(ALICE, &container.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_mutations_of_removing_container_are_rejected_without_waiting() {
    let mut config = test_config();
    config.runtime.call_timeout_secs = 1;
    let env = test_env_with(config).await;
    let container = env.running_container(ALICE, "dev").await;

    // The first remove attempt hangs until the call timeout, then is retried.
    env.runtime.fail_next(FakeOp::Remove, FakeFailure::Hang);
    let containers = Arc::clone(&env.wharf.containers);
    let id = container.id.clone();
    let removal = tokio::spawn(async move { containers.remove(ALICE, &id).await });

    assert!(
        eventually(Duration::from_secs(1), || {
            env.status(&container.id) == Some(ContainerStatus::Removing)
        })
        .await
    );

    let stop = tokio::time::timeout(
        Duration::from_millis(300),
        env.wharf.containers.stop(ALICE, &container.id),
    )
    .await
    .expect("stop must not wait for the container lock");
    assert_eq!(stop.unwrap_err().kind(), ErrorKind::Conflict);

    removal.await.unwrap().unwrap();
    assert_eq!(env.runtime.calls(FakeOp::Remove), 2);
    assert!(env.status(&container.id).is_none());
}

#[tokio::test]
async fn test_permissions_are_checked_before_daemon_calls() {
    let env = test_env().await;
    let container = env.running_container(ALICE, "dev").await;
    let containers = &env.wharf.containers;

    let err = containers.stop(BOB, &container.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
    assert_eq!(env.runtime.calls(FakeOp::Stop), 0);

    let err = containers.get(BOB, &container.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);

    assert!(containers.list(BOB).await.is_empty());
    assert_eq!(containers.list(ALICE).await.len(), 1);
    assert_eq!(containers.list(ADMIN).await.len(), 1);

    containers.stop(ADMIN, &container.id).await.unwrap();
}

#[tokio::test]
async fn test_reconciler_follows_daemon_events() {
    let env = test_env().await;
    let cancel = CancellationToken::new();
    let task = env.wharf.containers.spawn_reconciler(cancel.clone());
    assert!(eventually(Duration::from_secs(2), || env.runtime.subscriber_count() == 1).await);

    let container = env.running_container(ALICE, "dev").await;
    let id = container.id.clone();

    env.runtime.simulate_exit(&id, 137);
    assert!(
        eventually(Duration::from_secs(2), || {
            env.status(&id) == Some(ContainerStatus::Stopped)
        })
        .await
    );

    env.runtime.simulate_start(&id);
    assert!(
        eventually(Duration::from_secs(2), || {
            env.status(&id) == Some(ContainerStatus::Running)
        })
        .await
    );

    env.runtime.simulate_destroy(&id);
    assert!(eventually(Duration::from_secs(2), || env.status(&id).is_none()).await);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_reconciler_resubscribes_and_resyncs() {
    let env = test_env().await;
    let cancel = CancellationToken::new();
    let task = env.wharf.containers.spawn_reconciler(cancel.clone());
    assert!(eventually(Duration::from_secs(2), || env.runtime.subscriber_count() == 1).await);

    let container = env.running_container(ALICE, "dev").await;

    // Daemon restart: the stream ends and an exit is missed.
    env.runtime.drop_subscribers();
    env.runtime.simulate_exit(&container.id, 1);

    assert!(
        eventually(Duration::from_secs(3), || {
            env.status(&container.id) == Some(ContainerStatus::Stopped)
        })
        .await
    );
    assert_eq!(env.runtime.subscriber_count(), 1);

    cancel.cancel();
    task.await.unwrap();
}

#[tokio::test]
async fn test_restore_reloads_state_from_store() {
    let env = test_env().await;
    let kept = env.running_container(ALICE, "kept").await;
    let stopped = env.running_container(ALICE, "stopped").await;
    let gone = env.running_container(BOB, "gone").await;

    env.wharf.containers.stop(ALICE, &stopped.id).await.unwrap();
    // Changes while the service is down.
    env.runtime.simulate_destroy(&gone.id);
    env.runtime.simulate_exit(&kept.id, 0);
    env.wharf.shutdown().await;

    let restarted = Wharf::new(
        env.runtime.clone(),
        env.store.clone(),
        Arc::new(test_gate()),
        &env.config,
    )
    .unwrap();
    let report = restarted.containers.restore().await.unwrap();
    assert_eq!(report.containers, 2);
    assert_eq!(report.dropped, 1);

    let registry = restarted.containers.registry();
    assert_eq!(registry.status(&kept.id), Some(ContainerStatus::Stopped));
    assert_eq!(registry.status(&stopped.id), Some(ContainerStatus::Stopped));
    assert!(registry.get(&gone.id).is_none());
    assert_eq!(env.store.load_containers().await.unwrap().len(), 2);

    // Names survive a restart.
    let err = restarted
        .containers
        .create(ALICE, create_request("kept"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

use crate::common::Harness;
use std::time::Duration;
use testbed::orchestrator::EnvironmentState;
use testbed::TbError;

#[tokio::test]
async fn test_dispose_twice_is_noop() {
    let harness = Harness::new();
    let mut orch = harness.orchestrator();
    orch.build().await.unwrap();

    orch.dispose_services().await.unwrap();
    let ops = harness.provider.operations().len();
    orch.dispose_services().await.unwrap();

    assert_eq!(harness.provider.operations().len(), ops);
}

#[tokio::test]
async fn test_containers_removed_before_network() {
    let harness = Harness::new();
    let mut orch = harness.orchestrator();
    orch.build().await.unwrap();
    orch.dispose_services().await.unwrap();

    let ops = harness.provider.operations();
    let network_removed = ops
        .iter()
        .position(|op| op.starts_with("network:remove:"))
        .unwrap();
    let last_container_removed = ops
        .iter()
        .rposition(|op| op.starts_with("container:remove:"))
        .unwrap();
    assert!(last_container_removed < network_removed);
}

#[tokio::test]
async fn test_rollback_with_stuck_container_keeps_it_tracked() {
    let harness = Harness::new();
    harness.provider.never_ready("tmptaskservice");
    harness.provider.fail_removal("tmpauthenticationservice");
    let mut orch = harness.orchestrator();

    let err = orch.build().await.unwrap_err();
    assert!(matches!(err, TbError::ReadinessTimeout { .. }));
    assert_eq!(orch.state(), EnvironmentState::Failed);

    // The stuck container keeps the network alive, and both are still owned
    let live = orch.live_resources();
    assert_eq!(live.len(), 2);
    assert!(live.contains(&orch.service_name("authenticationservice").to_string()));
    assert!(live.contains(&orch.network_name().to_string()));

    let err = orch.dispose_services().await.unwrap_err();
    assert!(matches!(err, TbError::TeardownFailure(_)));

    harness.provider.allow_removal("tmpauthenticationservice");
    orch.dispose_services().await.unwrap();
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
}

#[tokio::test]
async fn test_dispose_unbuilt_environment() {
    let harness = Harness::new();
    let mut orch = harness.orchestrator();

    orch.dispose_services().await.unwrap();
    orch.dispose_images().await.unwrap();

    assert_eq!(orch.state(), EnvironmentState::Disposed);
    assert!(matches!(orch.build().await, Err(TbError::InvalidState(_))));
}

#[tokio::test]
async fn test_abandoned_build_is_fully_disposed() {
    let harness = Harness::new();
    harness.provider.set_latency(Duration::from_millis(20));
    let mut orch = harness.orchestrator();

    // Stores are up and images are building when the build is dropped
    let outcome = tokio::time::timeout(Duration::from_millis(30), orch.build()).await;
    assert!(outcome.is_err());
    assert_eq!(orch.state(), EnvironmentState::Building);
    assert!(orch
        .live_resources()
        .contains(&orch.store_name("authenticationservice").to_string()));

    orch.dispose_services().await.unwrap();

    assert_eq!(orch.state(), EnvironmentState::Disposed);
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
    assert!(orch.live_resources().is_empty());
}

#[tokio::test]
async fn test_build_dropped_mid_launch_is_disposed() {
    let harness = Harness::new();
    harness.provider.set_latency(Duration::from_millis(50));
    let mut orch = harness.orchestrator();

    let outcome = tokio::time::timeout(Duration::from_millis(10), orch.build()).await;
    assert!(outcome.is_err());

    orch.dispose_services().await.unwrap();
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
}

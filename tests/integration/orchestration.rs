use crate::common::{fast_config, Harness};
use std::time::Duration;
use testbed::orchestrator::EnvironmentState;
use testbed::TbError;

#[tokio::test]
async fn test_concurrent_environments_are_isolated() {
    let harness = Harness::new();
    let mut first = harness.orchestrator();
    let mut second = harness.orchestrator();

    let (a, b) = tokio::join!(first.build(), second.build());
    let a = a.unwrap().clone();
    let b = b.unwrap().clone();

    assert_ne!(a.network.name, b.network.name);
    assert_eq!(harness.provider.running_containers().len(), 8);
    assert_eq!(harness.provider.networks().len(), 2);

    let ports: Vec<u16> = a
        .services
        .iter()
        .chain(&b.services)
        .flat_map(|s| [s.port, s.store.port.host])
        .collect();
    let mut unique = ports.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ports.len());

    // Tearing one down leaves the other untouched
    first.dispose_services().await.unwrap();
    assert!(harness.resources_of(&first.id().to_string()).is_empty());
    assert_eq!(harness.resources_of(&second.id().to_string()).len(), 5);

    second.dispose_services().await.unwrap();
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
}

#[tokio::test]
async fn test_service_branches_run_in_parallel() {
    let harness = Harness::new();
    harness.provider.set_latency(Duration::from_millis(30));
    let mut orch = harness.orchestrator();

    orch.build().await.unwrap();

    assert!(harness.provider.peak_concurrency() >= 2);
    orch.dispose_services().await.unwrap();
}

#[tokio::test]
async fn test_never_ready_service_rolls_back_whole_environment() {
    let harness = Harness::new();
    harness.provider.never_ready("tmptaskservice");
    let mut orch = harness.orchestrator();

    let err = orch.build().await.unwrap_err();

    match err {
        TbError::ReadinessTimeout { resource, .. } => {
            assert_eq!(resource, orch.service_name("taskservice").to_string());
        }
        other => panic!("expected ReadinessTimeout, got {:?}", other),
    }
    assert_eq!(orch.state(), EnvironmentState::Failed);
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
    assert!(orch.live_resources().is_empty());

    // Rollback already removed everything; disposing afterwards is harmless
    orch.dispose_services().await.unwrap();
    assert_eq!(orch.state(), EnvironmentState::Disposed);
}

#[tokio::test]
async fn test_failure_cancels_steps_not_yet_started() {
    let harness = Harness::new();
    harness.provider.set_latency(Duration::from_millis(10));
    harness.provider.fail_run("tmpauthenticationservicedb");
    harness.provider.ready_after("tmptaskservicedb", 4);
    let mut orch = harness.orchestrator();

    let err = orch.build().await.unwrap_err();

    assert!(matches!(err, TbError::ProviderError(_)), "got {:?}", err);
    assert_eq!(harness.provider.build_count("tmptaskservice:test"), 0);
    assert!(harness.provider.containers().is_empty());
    assert!(harness.provider.networks().is_empty());
}

#[tokio::test]
async fn test_images_are_built_once_across_environments() {
    let harness = Harness::new();
    harness.provider.set_latency(Duration::from_millis(10));
    let mut first = harness.orchestrator();
    let mut second = harness.orchestrator();

    let (a, b) = tokio::join!(first.build(), second.build());
    a.unwrap();
    b.unwrap();

    assert_eq!(harness.provider.build_count("tmptaskservice:test"), 1);
    assert_eq!(harness.provider.build_count("tmpauthenticationservice:test"), 1);

    first.dispose_services().await.unwrap();
    second.dispose_services().await.unwrap();

    // A later environment reuses the images without building
    let mut third = harness.orchestrator();
    let env = third.build().await.unwrap();
    assert!(env.services.iter().all(|s| !s.image.built));
    third.dispose_services().await.unwrap();
}

#[tokio::test]
async fn test_dispose_images_after_services() {
    let harness = Harness::new();
    let mut orch = harness.orchestrator();
    orch.build().await.unwrap();

    orch.dispose_services().await.unwrap();
    orch.dispose_images().await.unwrap();

    assert!(harness.provider.images().is_empty());
    assert!(harness
        .provider
        .operations()
        .iter()
        .any(|op| op == "image:remove:tmptaskservice:test"));
}

#[tokio::test]
async fn test_http_readiness_path_is_polled() {
    let mut config = fast_config();
    for service in &mut config.services {
        service.readiness_path = Some("/health".to_string());
    }
    let harness = Harness::with_config(config);
    harness.provider.ready_after("tmpauthenticationservice", 2);
    let mut orch = harness.orchestrator();

    orch.build().await.unwrap();

    assert_eq!(harness.provider.probe_count("tmpauthenticationservice"), 3);
    orch.dispose_services().await.unwrap();
}

mod common;

use common::{TestCloud, dev_config};
use spotstack_cloud::{CloudError, DeploymentState, DeploymentStatus, ResourceKind};
use std::time::Duration;

#[tokio::test]
async fn test_concurrent_deploys_create_one_stack() {
    let t = TestCloud::new();
    t.cloud.delay_create(ResourceKind::Compute, Duration::from_millis(500));

    let (a, b) = tokio::join!(
        t.engine.deploy(dev_config("demo-1")),
        t.engine.deploy(dev_config("demo-1"))
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.status, DeploymentStatus::Running);
    assert_eq!(b.status, DeploymentStatus::Running);
    assert_eq!(
        a.resource_id(ResourceKind::Compute),
        b.resource_id(ResourceKind::Compute)
    );
    assert_eq!(t.cloud.created(ResourceKind::Compute), 1);
    assert_eq!(t.cloud.created(ResourceKind::Network), 1);
    t.engine.stop_monitor("demo-1").await;
}

#[tokio::test]
async fn test_separate_stacks_deploy_in_parallel() {
    let t = TestCloud::new();

    let (a, b) = tokio::join!(
        t.engine.deploy(dev_config("alpha")),
        t.engine.deploy(dev_config("beta"))
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_ne!(
        a.resource_id(ResourceKind::Compute),
        b.resource_id(ResourceKind::Compute)
    );
    assert_eq!(t.cloud.live(ResourceKind::Compute).len(), 2);

    let stacks: Vec<String> = t
        .engine
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.stack_id)
        .collect();
    assert_eq!(stacks, vec!["alpha", "beta"]);

    t.engine.stop_monitor("alpha").await;
    t.engine.stop_monitor("beta").await;
}

#[tokio::test]
async fn test_deploy_gives_up_on_held_lock() {
    let t = TestCloud::with_settings(|s| s.operation_lock_timeout_secs = 1);
    let held = t.engine.store().lock("demo-1").await.unwrap();

    let err = t.engine.deploy(dev_config("demo-1")).await.unwrap_err();
    assert!(matches!(err, CloudError::Lock(_)), "unexpected error: {err}");
    assert_eq!(t.cloud.calls(ResourceKind::Network, "discover"), 0);

    held.release().await.unwrap();
    t.engine.deploy(dev_config("demo-1")).await.unwrap();
    t.engine.stop_monitor("demo-1").await;
}

#[tokio::test]
async fn test_reconcile_marks_interrupted_records_failed() {
    let t = TestCloud::new();
    let store = t.engine.store();

    let config = dev_config("stuck").validate().unwrap();
    let mut stuck = DeploymentState::new(config);
    stuck.set_status(DeploymentStatus::SecurityReady);
    let lock = store.lock("stuck").await.unwrap();
    store.put(&lock, &stuck).await.unwrap();
    lock.release().await.unwrap();

    t.engine.deploy(dev_config("healthy")).await.unwrap();
    t.engine.stop_monitor("healthy").await;

    let marked = t.engine.reconcile().await.unwrap();
    assert_eq!(marked, vec!["stuck".to_string()]);

    let state = t.engine.status("stuck").await.unwrap();
    assert_eq!(state.status, DeploymentStatus::Failed);
    assert_eq!(state.failed_stage, Some(DeploymentStatus::SecurityReady));
    assert_eq!(state.last_error.as_deref(), Some("interrupted"));

    let healthy = t.engine.status("healthy").await.unwrap();
    assert_eq!(healthy.status, DeploymentStatus::Running);

    // nothing left to mark
    assert!(t.engine.reconcile().await.unwrap().is_empty());
}

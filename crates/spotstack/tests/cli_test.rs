#![allow(deprecated)] // cargo_bin works for a single-binary package

use assert_cmd::Command;
use chrono::Utc;
use predicates::prelude::*;
use spotstack_cloud::{
    DeploymentConfig, DeploymentState, DeploymentStatus, Provenance, RecoveryMode,
    ResourceHandle, ResourceKind, RollbackRecord, RollbackTrigger, StateStore, TierKind,
};
use std::path::Path;
use tempfile::TempDir;

/// Run the binary isolated from any settings file on the host.
fn spotstack(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("spotstack").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("SPOTSTACK_CONFIG")
        .env("SPOTSTACK_STATE_DIR", dir.path().join("state"))
        .env("NO_COLOR", "1");
    cmd
}

async fn seed(state_dir: &Path) {
    let store = StateStore::new(state_dir);

    let config = DeploymentConfig::new("demo-1", TierKind::Dev, "us-east-1")
        .validate()
        .unwrap();
    let mut state = DeploymentState::new(config);
    state.upsert_handle(ResourceHandle::new(ResourceKind::Network, "vpc-shared", Provenance::Reused));
    state.upsert_handle(ResourceHandle::new(ResourceKind::Storage, "vol-0002", Provenance::Created));
    state.upsert_handle(ResourceHandle::new(ResourceKind::Compute, "i-0004", Provenance::Created));
    state.public_ip = Some("203.0.113.4".to_string());
    state.endpoint = state.public_ip.clone();
    state.push_rollback(RollbackRecord {
        id: "rb-1".to_string(),
        timestamp: Utc::now(),
        trigger: RollbackTrigger::Interruption,
        mode: RecoveryMode::Restore,
        deleted: vec!["i-0003".to_string()],
        preserved: vec!["vol-0002".to_string()],
        success: true,
        error: None,
    });
    state.set_status(DeploymentStatus::Running);

    let lock = store.lock("demo-1").await.unwrap();
    store.put(&lock, &state).await.unwrap();
    lock.release().await.unwrap();
}

#[test]
fn test_cli_help() {
    let dir = tempfile::tempdir().unwrap();
    spotstack(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("list"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("history"))
        .stdout(predicate::str::contains("settings"));
}

#[test]
fn test_cli_version() {
    let dir = tempfile::tempdir().unwrap();
    spotstack(&dir)
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("spotstack"));
}

#[test]
fn test_invalid_command() {
    let dir = tempfile::tempdir().unwrap();
    spotstack(&dir).arg("deploy").assert().failure();
}

#[test]
fn test_list_empty_state_dir() {
    let dir = tempfile::tempdir().unwrap();
    spotstack(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No stacks recorded"));
}

#[tokio::test]
async fn test_list_shows_recorded_stack() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("state")).await;

    spotstack(&dir)
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("demo-1"))
        .stdout(predicate::str::contains("running"))
        .stdout(predicate::str::contains("1 stack(s)"));
}

#[tokio::test]
async fn test_status_shows_resources() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("state")).await;

    spotstack(&dir)
        .args(["status", "demo-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("203.0.113.4"))
        .stdout(predicate::str::contains("vpc-shared"))
        .stdout(predicate::str::contains("reused"))
        .stdout(predicate::str::contains("i-0004"));
}

#[tokio::test]
async fn test_status_json_is_the_record() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("state")).await;

    let output = spotstack(&dir)
        .args(["status", "demo-1", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let state: DeploymentState = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(state.stack_id, "demo-1");
    assert_eq!(state.status, DeploymentStatus::Running);
    assert_eq!(state.resources.len(), 3);
}

#[test]
fn test_status_unknown_stack_fails() {
    let dir = tempfile::tempdir().unwrap();
    spotstack(&dir)
        .args(["status", "missing"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

#[tokio::test]
async fn test_history_lists_rollbacks() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir.path().join("state")).await;

    spotstack(&dir)
        .args(["history", "demo-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("interruption"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("i-0003"));
}

#[test]
fn test_settings_prints_yaml() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("spotstack.yaml"),
        "monitor:\n  failure_threshold: 7\n",
    )
    .unwrap();

    spotstack(&dir)
        .arg("settings")
        .assert()
        .success()
        .stdout(predicate::str::contains("spotstack.yaml"))
        .stdout(predicate::str::contains("failure_threshold: 7"))
        .stdout(predicate::str::contains("poll_interval_secs"));
}

#[test]
fn test_invalid_settings_fail() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("spotstack.yaml"),
        "monitor:\n  poll_interval_secs: 0\n",
    )
    .unwrap();

    spotstack(&dir)
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("poll_interval_secs"));
}

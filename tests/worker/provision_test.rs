//! Installing the worker executable: gating, stamps, cleanup and restarts.

mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{call_once, client_for, link_echo, options, ECHO};
use regex::Regex;
use serde_json::json;
use tether::worker::install::{read_stamp, stamp_path};
use tether::worker::{
    CommandProvisioner, InstallOutcome, InstallState, NoopProvisioner, WorkerError, WorkerEvent,
};

fn link_provisioner() -> Arc<CommandProvisioner> {
    Arc::new(CommandProvisioner::new(vec![
        "ln".to_string(),
        "-sf".to_string(),
        ECHO.to_string(),
        "{exe}".to_string(),
    ]))
}

#[tokio::test]
async fn test_install_on_start_builds_and_stamps() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    let client = client_for(exe.clone(), options(true), link_provisioner());
    let mut events = client.subscribe();

    assert_eq!(client.install_state(), InstallState::Busy);
    client.wait_until_installed().await;

    assert_eq!(client.install_state(), InstallState::Done);
    assert!(exe.exists());
    assert_eq!(read_stamp(&exe).as_deref(), Some("1.0.0"));
    assert_eq!(
        events.recv().await.unwrap(),
        WorkerEvent::Provisioned {
            version: "1.0.0".to_string(),
            error: None,
        }
    );

    let reply = client
        .call_timeout("echo", json!({ "ok": true }), Duration::from_secs(5))
        .await;
    assert_eq!(reply.into_result().unwrap(), json!({ "ok": true }));
}

#[tokio::test]
async fn test_calls_are_refused_until_installed() {
    let dir = tempfile::tempdir().unwrap();
    let exe = link_echo(dir.path(), "worker");
    let client = client_for(exe, options(false), Arc::new(NoopProvisioner));

    assert_eq!(client.install_state(), InstallState::Unset);
    let reply = client
        .call_timeout("echo", json!({}), Duration::from_secs(1))
        .await;
    assert_eq!(reply.error_text(), "call(echo) aborted: install is not done");

    assert!(matches!(client.install(false).await, InstallOutcome::Built { .. }));
    let reply = client
        .call_timeout("echo", json!({}), Duration::from_secs(5))
        .await;
    assert!(reply.is_ok());
}

#[tokio::test]
async fn test_ensure_ready_installs_when_not_started() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    let client = client_for(exe.clone(), options(false), link_provisioner());

    client.wait_until_installed().await;
    assert_eq!(client.install_state(), InstallState::Unset);

    client.ensure_ready().await;
    assert_eq!(client.install_state(), InstallState::Done);
    assert!(exe.exists());

    let reply = client
        .call_timeout("echo", json!({ "ready": true }), Duration::from_secs(5))
        .await;
    assert_eq!(reply.into_result().unwrap(), json!({ "ready": true }));

    // a second call has nothing left to do
    client.ensure_ready().await;
    assert_eq!(client.install_state(), InstallState::Done);
}

#[tokio::test]
async fn test_install_is_attempted_once_per_version() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    let client = client_for(exe, options(false), link_provisioner());

    let (a, b) = tokio::join!(client.install(false), client.install(false));
    let built = [&a, &b]
        .iter()
        .filter(|o| matches!(o, InstallOutcome::Built { .. }))
        .count();
    let skipped = [&a, &b]
        .iter()
        .filter(|o| matches!(o, InstallOutcome::AlreadyAttempted))
        .count();
    assert_eq!((built, skipped), (1, 1));

    assert!(matches!(
        client.install(true).await,
        InstallOutcome::AlreadyAttempted
    ));
}

#[tokio::test]
async fn test_up_to_date_executable_is_not_rebuilt() {
    let dir = tempfile::tempdir().unwrap();
    let exe = link_echo(dir.path(), "worker");
    fs::write(stamp_path(&exe), "1.0.0").unwrap();

    // the provisioner would fail if it ran
    let failing = Arc::new(CommandProvisioner::new(vec!["false".to_string()]));
    let client = client_for(exe, options(false), failing);

    assert!(matches!(client.install(false).await, InstallOutcome::UpToDate));
    assert_eq!(client.install_state(), InstallState::Done);
}

#[tokio::test]
async fn test_missing_executable_is_installed_on_first_call() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    let client = client_for(exe.clone(), options(false), link_provisioner());

    // `call` is not gated; spawning installs the missing executable first
    let reply = call_once(&client, "echo", json!({ "lazy": 1 })).await;
    assert_eq!(reply.into_result().unwrap(), json!({ "lazy": 1 }));
    assert!(exe.exists());
    assert_eq!(client.install_state(), InstallState::Done);
}

#[tokio::test]
async fn test_failed_install_aborts_requests() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    let failing = Arc::new(CommandProvisioner::new(vec!["false".to_string()]));
    let client = client_for(exe, options(true), failing);
    let mut events = client.subscribe();

    client.wait_until_installed().await;
    match events.recv().await.unwrap() {
        WorkerEvent::Provisioned { error, .. } => assert!(error.is_some()),
        other => panic!("unexpected event: {:?}", other),
    }

    let reply = client
        .call_timeout("echo", json!({}), Duration::from_secs(5))
        .await;
    match reply.error {
        Some(WorkerError::Aborted(inner)) => assert!(matches!(*inner, WorkerError::Spawn(_))),
        other => panic!("expected abort, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stale_binaries_are_removed_after_install() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    fs::write(dir.path().join("worker_0.9"), "old").unwrap();
    fs::write(dir.path().join("notes.txt"), "keep").unwrap();

    let mut opts = options(false);
    opts.stale_pattern = Some(Regex::new(r"^worker_").unwrap());
    let client = client_for(exe.clone(), opts, link_provisioner());

    assert!(matches!(client.install(false).await, InstallOutcome::Built { .. }));
    assert!(exe.exists());
    assert!(!dir.path().join("worker_0.9").exists());
    assert!(dir.path().join("notes.txt").exists());
}

#[tokio::test]
async fn test_stamp_survives_a_broad_stale_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let exe = dir.path().join("worker");
    fs::write(dir.path().join("worker_0.9"), "old").unwrap();

    let mut opts = options(false);
    opts.stale_pattern = Some(Regex::new(r"^worker").unwrap());
    let client = client_for(exe.clone(), opts.clone(), link_provisioner());
    assert!(matches!(client.install(false).await, InstallOutcome::Built { .. }));
    assert_eq!(read_stamp(&exe).as_deref(), Some("1.0.0"));
    assert!(!dir.path().join("worker_0.9").exists());

    // the next client finds the stamp and skips the build
    let again = client_for(exe, opts, link_provisioner());
    assert!(matches!(again.install(false).await, InstallOutcome::UpToDate));
}

#[tokio::test]
async fn test_running_worker_is_restarted_after_install() {
    let dir = tempfile::tempdir().unwrap();
    let exe = link_echo(dir.path(), "worker");
    let client = client_for(exe, options(false), link_provisioner());

    let before = call_once(&client, "pid", json!({})).await.into_result().unwrap();

    assert!(matches!(client.install(true).await, InstallOutcome::Built { .. }));

    let after = call_once(&client, "pid", json!({})).await.into_result().unwrap();
    assert_ne!(before["pid"], after["pid"]);
}

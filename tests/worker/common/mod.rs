//! Shared fixtures for tests that talk to the `tether-echo` worker.

#![allow(dead_code)]

use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tether::worker::{
    ClientOptions, Completion, InstallState, LaunchSpec, NoopProvisioner, Provisioner, Reply,
    WorkerClient,
};
use tokio::sync::oneshot;

pub const ECHO: &str = env!("CARGO_BIN_EXE_tether-echo");
pub const TAG: &str = "test-tag";

/// Link the echo worker into `dir` so stamps and stale files stay there.
pub fn link_echo(dir: &Path, name: &str) -> PathBuf {
    let exe = dir.join(name);
    symlink(ECHO, &exe).unwrap();
    exe
}

pub fn options(install_on_start: bool) -> ClientOptions {
    ClientOptions {
        version: "1.0.0".to_string(),
        call_timeout: Duration::from_secs(5),
        provision_poll: Duration::from_millis(10),
        install_on_start,
        ..ClientOptions::default()
    }
}

pub fn client_for(
    exe: PathBuf,
    options: ClientOptions,
    provisioner: Arc<dyn Provisioner>,
) -> WorkerClient {
    WorkerClient::launch(LaunchSpec::new(exe, TAG), options, provisioner)
}

/// A client whose install has completed against an existing echo worker.
pub async fn ready_client(dir: &Path) -> WorkerClient {
    let exe = link_echo(dir, "tether-echo");
    let client = client_for(exe, options(true), Arc::new(NoopProvisioner));
    client.wait_until_installed().await;
    assert_eq!(client.install_state(), InstallState::Done);
    client
}

/// Submit with `call` (no install gate) and await the first reply.
pub async fn call_once(client: &WorkerClient, method: &str, params: serde_json::Value) -> Reply {
    let (tx, rx) = oneshot::channel();
    client.call(
        method,
        params,
        Completion::once(move |reply| {
            let _ = tx.send(reply);
        }),
    );
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply within 5s")
        .expect("completion invoked")
}

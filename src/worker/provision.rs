//! Provisioning gate and the provisioner boundary.
//!
//! The gate is a tri-state flag per target version. Only the caller that
//! moves a version from `Unset` to `Busy` may run the provisioner; everyone
//! else waits for `Done`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::debug;

use super::error::{WorkerError, WorkerResult};

/// Install state for one target version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallState {
    #[default]
    Unset,
    Busy,
    Done,
}

impl InstallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Busy => "busy",
            Self::Done => "done",
        }
    }
}

/// Per-version install flags.
#[derive(Debug, Default)]
pub struct ProvisionGate {
    states: DashMap<String, Arc<watch::Sender<InstallState>>>,
}

impl ProvisionGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, version: &str) -> Arc<watch::Sender<InstallState>> {
        self.states
            .entry(version.to_string())
            .or_insert_with(|| Arc::new(watch::channel(InstallState::Unset).0))
            .clone()
    }

    pub fn state(&self, version: &str) -> InstallState {
        self.states
            .get(version)
            .map(|slot| *slot.borrow())
            .unwrap_or_default()
    }

    /// Claim the single install attempt for `version`.
    ///
    /// Returns `None` if an attempt is running or has already finished.
    pub fn begin(&self, version: &str) -> Option<ProvisionTicket> {
        let slot = self.slot(version);
        let claimed = slot.send_if_modified(|state| {
            if *state == InstallState::Unset {
                *state = InstallState::Busy;
                true
            } else {
                false
            }
        });

        claimed.then(|| ProvisionTicket {
            version: version.to_string(),
            slot,
        })
    }

    /// Wait until `version` is no longer `Busy`.
    ///
    /// Logs every `interval` while still waiting.
    pub async fn wait_while_busy(&self, version: &str, interval: Duration) {
        let mut rx = self.slot(version).subscribe();
        loop {
            let settled = tokio::time::timeout(interval, rx.wait_for(|s| *s != InstallState::Busy))
                .await
                .is_ok();
            if settled {
                return;
            }
            debug!(version, "waiting for provisioning to finish");
        }
    }
}

/// Proof of holding the install attempt for a version.
///
/// The version is marked `Done` when the ticket is dropped, whatever the
/// outcome of the attempt.
#[derive(Debug)]
pub struct ProvisionTicket {
    version: String,
    slot: Arc<watch::Sender<InstallState>>,
}

impl ProvisionTicket {
    pub fn version(&self) -> &str {
        &self.version
    }
}

impl Drop for ProvisionTicket {
    fn drop(&mut self) {
        self.slot.send_replace(InstallState::Done);
    }
}

/// Makes the worker executable present on disk.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Build, fetch or copy the executable for `version` to `exe`.
    ///
    /// Returns a transcript of what was done.
    async fn provision(&self, version: &str, exe: &Path) -> WorkerResult<String>;

    /// One-line description for diagnostics.
    fn describe(&self) -> String;
}

/// Provisioner for setups where the executable is installed out of band.
#[derive(Debug, Default, Clone)]
pub struct NoopProvisioner;

#[async_trait]
impl Provisioner for NoopProvisioner {
    async fn provision(&self, _version: &str, _exe: &Path) -> WorkerResult<String> {
        Ok("no provisioning configured".to_string())
    }

    fn describe(&self) -> String {
        "(none)".to_string()
    }
}

/// Runs an external build command, e.g. `go build -o {exe}`.
///
/// `{exe}` and `{version}` in arguments are substituted before running.
#[derive(Debug, Clone)]
pub struct CommandProvisioner {
    command: Vec<String>,
    dir: Option<PathBuf>,
    env: HashMap<String, String>,
}

impl CommandProvisioner {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            dir: None,
            env: HashMap::new(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn resolved_args(&self, version: &str, exe: &Path) -> Vec<String> {
        let exe = exe.to_string_lossy();
        self.command
            .iter()
            .map(|arg| arg.replace("{exe}", &exe).replace("{version}", version))
            .collect()
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, version: &str, exe: &Path) -> WorkerResult<String> {
        let args = self.resolved_args(version, exe);
        let Some((program, rest)) = args.split_first() else {
            return Err(WorkerError::Provision {
                version: version.to_string(),
                message: "empty provisioning command".to_string(),
            });
        };

        let mut command = Command::new(program);
        command
            .args(rest)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.dir {
            command.current_dir(dir);
        }

        debug!(cmd = ?args, dir = ?self.dir, "running provisioning command");

        let output = command.output().await.map_err(|e| WorkerError::Provision {
            version: version.to_string(),
            message: format!("cmd: `{}`\nexception: `{}`", args.join(" "), e),
        })?;

        let transcript = format!(
            "cmd: `{}`\nstdout: `{}`\nstderr: `{}`",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim(),
        );

        if output.status.success() {
            Ok(transcript)
        } else {
            Err(WorkerError::Provision {
                version: version.to_string(),
                message: format!("{}\nstatus: {}", transcript, output.status),
            })
        }
    }

    fn describe(&self) -> String {
        self.command.join(" ")
    }
}

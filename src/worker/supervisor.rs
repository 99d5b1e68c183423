//! Worker process lifecycle.
//!
//! The supervisor owns the one worker handle. It is driven exclusively by
//! the sender loop, which calls [`Supervisor::ensure_alive`] before each
//! write and [`Supervisor::stop`] after a failed one.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::error::{WorkerError, WorkerResult};
use super::event::WorkerEvent;
use super::install::Installer;
use super::provision::InstallState;
use super::receiver::spawn_reader;

/// Everything needed to launch the worker.
///
/// The environment is complete: the worker does not inherit anything that
/// is not listed here.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exe: PathBuf,
    /// Memory guard threshold in MB; 0 disables it.
    pub oom: u64,
    pub poll_secs: u64,
    pub tag: String,
    pub env: HashMap<String, String>,
    /// Where worker stderr goes; inherited when unset.
    pub stderr_log: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(exe: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            exe: exe.into(),
            oom: 0,
            poll_secs: 30,
            tag: tag.into(),
            env: HashMap::new(),
            stderr_log: None,
        }
    }

    /// Command-line flags passed to the worker.
    pub fn args(&self) -> Vec<String> {
        vec![
            "-oom".to_string(),
            self.oom.to_string(),
            "-poll".to_string(),
            self.poll_secs.to_string(),
            "-tag".to_string(),
            self.tag.clone(),
        ]
    }

    fn stderr(&self) -> io::Result<Stdio> {
        match &self.stderr_log {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Stdio::from(file))
            }
            None => Ok(Stdio::inherit()),
        }
    }

    fn command(&self) -> io::Result<Command> {
        let mut command = Command::new(&self.exe);
        command
            .args(self.args())
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr()?)
            .kill_on_drop(true);
        Ok(command)
    }
}

/// A running worker process and its pipes.
pub struct WorkerHandle {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    reader: JoinHandle<()>,
    pid: Option<u32>,
    started_at: Instant,
}

impl WorkerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Whether the process is running and its stdout is still being read.
    pub fn is_alive(&mut self) -> bool {
        !self.reader.is_finished() && matches!(self.child.try_wait(), Ok(None))
    }

    /// Write one complete request line and flush it.
    pub async fn write_line(&mut self, line: &[u8]) -> WorkerResult<()> {
        self.stdin
            .write_all(line)
            .await
            .map_err(WorkerError::Write)?;
        self.stdin.flush().await.map_err(WorkerError::Write)
    }
}

/// Owns the worker process and restarts it on demand.
pub struct Supervisor {
    launch: LaunchSpec,
    installer: Arc<Installer>,
    lines: mpsc::UnboundedSender<String>,
    events: broadcast::Sender<WorkerEvent>,
    provision_poll: Duration,
    handle: Option<WorkerHandle>,
    starts: u64,
}

impl Supervisor {
    /// `lines` receives every line the worker prints on stdout.
    pub fn new(
        launch: LaunchSpec,
        installer: Arc<Installer>,
        lines: mpsc::UnboundedSender<String>,
        events: broadcast::Sender<WorkerEvent>,
        provision_poll: Duration,
    ) -> Self {
        Self {
            launch,
            installer,
            lines,
            events,
            provision_poll,
            handle: None,
            starts: 0,
        }
    }

    /// Number of processes launched so far.
    pub fn starts(&self) -> u64 {
        self.starts
    }

    pub fn is_alive(&mut self) -> bool {
        self.handle.as_mut().is_some_and(WorkerHandle::is_alive)
    }

    /// Return the live worker, starting a new one if needed.
    ///
    /// A start failure is reported once; the next call tries again from
    /// scratch.
    pub async fn ensure_alive(&mut self) -> WorkerResult<&mut WorkerHandle> {
        if !self.is_alive() {
            self.stop();
            let handle = self.start().await?;
            self.handle = Some(handle);
        }

        self.handle
            .as_mut()
            .ok_or_else(|| WorkerError::ExitedOnStart("no worker handle".to_string()))
    }

    async fn start(&mut self) -> WorkerResult<WorkerHandle> {
        if self.installer.state() != InstallState::Busy {
            self.installer.ensure_installed().await;
        }
        self.installer.wait_while_busy(self.provision_poll).await;

        let mut command = self.launch.command().map_err(WorkerError::Spawn)?;
        let mut child = command.spawn().map_err(|e| {
            error!(exe = %self.launch.exe.display(), error = %e, "cannot start worker");
            WorkerError::Spawn(e)
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(WorkerError::Spawn(io::Error::other("worker stdio not captured")));
        };

        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                error!(%status, "worker exited immediately after start");
                return Err(WorkerError::ExitedOnStart(status.to_string()));
            }
            Err(e) => return Err(WorkerError::Spawn(e)),
        }

        let pid = child.id();
        let reader = spawn_reader(stdout, self.lines.clone());
        self.starts += 1;

        info!(?pid, exe = %self.launch.exe.display(), tag = %self.launch.tag, "worker started");
        let _ = self.events.send(WorkerEvent::Started { pid });

        Ok(WorkerHandle {
            child,
            stdin: BufWriter::new(stdin),
            reader,
            pid,
            started_at: Instant::now(),
        })
    }

    /// Release the current worker, if any. Does not wait for it to exit.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let WorkerHandle {
            child,
            stdin,
            reader,
            pid,
            ..
        } = handle;

        drop(stdin);
        reader.abort();
        drop(child);

        debug!(?pid, "worker released");
        let _ = self.events.send(WorkerEvent::Stopped);
    }

    /// Stop the worker if it was started before `built_at`.
    pub fn stop_if_started_before(&mut self, built_at: Instant) {
        if self
            .handle
            .as_ref()
            .is_some_and(|h| h.started_at < built_at)
        {
            info!("restarting worker to pick up new install");
            self.stop();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

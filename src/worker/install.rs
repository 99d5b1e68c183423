//! Worker installation: gating, version stamps, cleanup and diagnostics.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use super::error::WorkerError;
use super::event::WorkerEvent;
use super::provision::{InstallState, ProvisionGate, ProvisionTicket, Provisioner};

/// What an install request ended up doing.
#[derive(Debug)]
pub enum InstallOutcome {
    /// An attempt for this version was already made; nothing ran.
    AlreadyAttempted,
    /// The executable was present and stamped with the target version.
    UpToDate,
    /// The provisioner ran successfully.
    Built { transcript: String, finished_at: Instant },
    /// The provisioner ran and failed.
    Failed(WorkerError),
}

impl InstallOutcome {
    /// Time a fresh executable became available, if one was built.
    pub fn built_at(&self) -> Option<Instant> {
        match self {
            Self::Built { finished_at, .. } => Some(*finished_at),
            _ => None,
        }
    }
}

/// Path of the stamp file recording which version built `exe`.
pub fn stamp_path(exe: &Path) -> PathBuf {
    let mut name = exe.file_name().unwrap_or_default().to_os_string();
    name.push(".version");
    exe.with_file_name(name)
}

pub fn read_stamp(exe: &Path) -> Option<String> {
    fs::read_to_string(stamp_path(exe))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Drives the provisioner for one executable and target version.
pub struct Installer {
    gate: Arc<ProvisionGate>,
    provisioner: Arc<dyn Provisioner>,
    exe: PathBuf,
    version: String,
    stale_pattern: Option<Regex>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Installer {
    pub fn new(
        gate: Arc<ProvisionGate>,
        provisioner: Arc<dyn Provisioner>,
        exe: impl Into<PathBuf>,
        version: impl Into<String>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            gate,
            provisioner,
            exe: exe.into(),
            version: version.into(),
            stale_pattern: None,
            events,
        }
    }

    /// Remove files next to the executable matching `pattern` after installs.
    pub fn with_stale_pattern(mut self, pattern: Regex) -> Self {
        self.stale_pattern = Some(pattern);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn exe(&self) -> &Path {
        &self.exe
    }

    pub fn state(&self) -> InstallState {
        self.gate.state(&self.version)
    }

    pub fn provisioner(&self) -> &dyn Provisioner {
        self.provisioner.as_ref()
    }

    pub fn exe_exists(&self) -> bool {
        self.exe.exists()
    }

    /// Install if the executable is missing.
    pub async fn ensure_installed(&self) -> Option<InstallOutcome> {
        if self.exe_exists() {
            return None;
        }
        Some(self.install(true).await)
    }

    pub async fn wait_while_busy(&self, interval: Duration) {
        self.gate.wait_while_busy(&self.version, interval).await
    }

    /// Claim the install attempt for this version without running it.
    pub fn try_begin(&self) -> Option<ProvisionTicket> {
        let ticket = self.gate.begin(&self.version);
        if ticket.is_none() {
            info!(
                version = %self.version,
                "installation aborted, install already called for this version"
            );
        }
        ticket
    }

    /// Run the single install attempt for this version.
    ///
    /// Skips the provisioner when the executable exists, its stamp matches the
    /// target version and `force` is false.
    pub async fn install(&self, force: bool) -> InstallOutcome {
        match self.try_begin() {
            Some(ticket) => self.run(ticket, force).await,
            None => InstallOutcome::AlreadyAttempted,
        }
    }

    /// Run a claimed install attempt. The ticket is released when done.
    pub async fn run(&self, ticket: ProvisionTicket, force: bool) -> InstallOutcome {
        let started = Instant::now();
        let stamped = read_stamp(&self.exe).as_deref() == Some(self.version.as_str());

        let outcome = if !force && self.exe_exists() && stamped {
            InstallOutcome::UpToDate
        } else {
            info!(version = %self.version, exe = %self.exe.display(), "installing worker");
            match self.provisioner.provision(&self.version, &self.exe).await {
                Ok(transcript) if self.exe_exists() => {
                    if let Err(e) = fs::write(stamp_path(&self.exe), &self.version) {
                        warn!(error = %e, "failed to record installed version");
                    }
                    InstallOutcome::Built {
                        transcript,
                        finished_at: Instant::now(),
                    }
                }
                Ok(transcript) => InstallOutcome::Failed(WorkerError::Provision {
                    version: self.version.clone(),
                    message: format!("{}\nexecutable still missing after provisioning", transcript),
                }),
                Err(e) => InstallOutcome::Failed(e),
            }
        };

        drop(ticket);

        let failure = match &outcome {
            InstallOutcome::Failed(e) => {
                error!(version = %self.version, error = %e, "worker install failed");
                Some(e.to_string())
            }
            _ => {
                info!(
                    version = %self.version,
                    elapsed = ?started.elapsed(),
                    "worker ready"
                );
                None
            }
        };
        let _ = self.events.send(WorkerEvent::Provisioned {
            version: self.version.clone(),
            error: failure,
        });

        if outcome.built_at().is_some() {
            self.remove_stale_binaries();
        }

        outcome
    }

    /// Delete old executables next to the current one. Failures are logged.
    pub fn remove_stale_binaries(&self) -> Vec<PathBuf> {
        let Some(pattern) = &self.stale_pattern else {
            return Vec::new();
        };
        let Some(dir) = self.exe.parent() else {
            return Vec::new();
        };
        let current = self.exe.file_name();
        let stamp = stamp_path(&self.exe);

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "cannot scan for old binaries");
                return Vec::new();
            }
        };

        let mut removed = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            if Some(name.as_os_str()) == current || stamp.file_name() == Some(name.as_os_str()) {
                continue;
            }
            if !pattern.is_match(&name.to_string_lossy()) {
                continue;
            }
            let path = entry.path();
            info!(path = %path.display(), "removing old binary");
            match fs::remove_file(&path) {
                Ok(()) => removed.push(path),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old binary"),
            }
        }
        removed
    }
}

/// Diagnostic rows describing the install.
pub fn sanity_report(installer: &Installer, tag: &str) -> Vec<(String, String)> {
    let exe = installer.exe();
    let presence = |p: &Path| if p.exists() { "ok" } else { "missing" };

    vec![
        ("install state".to_string(), installer.state().as_str().to_string()),
        ("version".to_string(), installer.version().to_string()),
        ("tag".to_string(), tag.to_string()),
        (
            "worker.exe".to_string(),
            format!("{} ({})", exe.display(), presence(exe)),
        ),
        (
            "installed version".to_string(),
            read_stamp(exe).unwrap_or_else(|| "(not set)".to_string()),
        ),
        ("provision".to_string(), installer.provisioner().describe()),
        ("crate version".to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ]
}

/// Render report rows as an aligned block.
///
/// Multi-line values continue under their key.
pub fn format_report(rows: &[(String, String)]) -> String {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let indent = format!("\n| {}> ", " ".repeat(width));

    rows.iter()
        .map(|(k, v)| format!("| {:>width$}: {}", k, v.replace('\n', &indent), width = width))
        .collect::<Vec<_>>()
        .join("\n")
}

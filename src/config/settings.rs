//! TOML-based configuration for tether.
//!
//! Supports a config file (tether.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [worker]
//! path = "${HOME}/.local/share/tether/bin/worker"
//! version = "1.4.0"
//! tag = "1.4.0"
//! oom = 0
//! poll_secs = 30
//! log_file = "/tmp/worker.log"
//!
//! [worker.env]
//! GOGC = "10"
//!
//! [provision]
//! command = ["go", "build", "-o", "{exe}"]
//! dir = "./worker"
//! stale_pattern = "^worker(_.+)?$"
//!
//! [client]
//! blocking_timeout_ms = 1000
//! provision_poll_ms = 100
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::worker::{ClientOptions, CommandProvisioner, LaunchSpec, NoopProvisioner, Provisioner};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// How the worker is launched.
    pub worker: WorkerSettings,

    /// How the worker executable is produced.
    pub provision: ProvisionSettings,

    /// Client-side timing.
    pub client: ClientSettings,

    /// File these settings were read from, if any.
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Worker launch configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Path to the worker executable (supports ${ENV_VAR} expansion).
    pub path: Option<String>,

    /// Install version; defaults to this crate's version.
    pub version: Option<String>,

    /// Protocol tag; defaults to this crate's version.
    pub tag: Option<String>,

    /// Memory guard threshold in MB (0 = disabled).
    pub oom: u64,

    /// Worker poll interval in seconds.
    pub poll_secs: u64,

    /// File that receives worker stderr.
    pub log_file: Option<String>,

    /// Seed the worker environment from this process's environment.
    pub inherit_env: bool,

    /// Extra environment variables (values support ${ENV_VAR} expansion).
    pub env: HashMap<String, String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: None,
            version: None,
            tag: None,
            oom: 0,
            poll_secs: 30,
            log_file: None,
            inherit_env: true,
            env: HashMap::new(),
        }
    }
}

/// Provisioning configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProvisionSettings {
    /// Build command; `{exe}` and `{version}` are substituted. Empty disables
    /// provisioning.
    pub command: Vec<String>,

    /// Working directory for the build command.
    pub dir: Option<String>,

    /// Extra environment for the build command.
    pub env: HashMap<String, String>,

    /// Regex matching old executables to delete after an install.
    pub stale_pattern: Option<String>,
}

/// Client timing configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Deadline for blocking calls.
    pub blocking_timeout_ms: u64,

    /// Interval between checks while provisioning is busy.
    pub provision_poll_ms: u64,

    /// Start installing as soon as the client starts.
    pub install_on_start: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            blocking_timeout_ms: 1000,
            provision_poll_ms: 100,
            install_on_start: true,
        }
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut settings: Settings = toml::from_str(&content)?;
        settings.source = Some(path.to_path_buf());
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `TETHER_CONFIG`
    /// 2. `./tether.toml`
    /// 3. `~/.config/tether/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("tether.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("tether").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    pub fn version(&self) -> String {
        self.worker
            .version
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    pub fn tag(&self) -> String {
        self.worker.tag.clone().unwrap_or_else(|| self.version())
    }

    /// Resolve the worker executable path.
    ///
    /// Falls back to `<data dir>/tether/bin/tether-worker`.
    pub fn worker_path(&self) -> Result<PathBuf, SettingsError> {
        if let Some(path) = &self.worker.path {
            return Ok(PathBuf::from(expand_env_vars(path)?));
        }

        let base = dirs::data_dir().ok_or_else(|| {
            SettingsError::InvalidConfig(
                "no data directory; set worker.path explicitly".to_string(),
            )
        })?;
        Ok(base.join("tether").join("bin").join("tether-worker"))
    }

    /// The complete environment the worker is launched with.
    pub fn worker_env(&self) -> Result<HashMap<String, String>, SettingsError> {
        let mut env: HashMap<String, String> = if self.worker.inherit_env {
            env::vars().collect()
        } else {
            HashMap::new()
        };
        for (key, value) in &self.worker.env {
            env.insert(key.clone(), expand_env_vars(value)?);
        }
        Ok(env)
    }

    /// Everything needed to spawn the worker.
    pub fn launch_spec(&self) -> Result<LaunchSpec, SettingsError> {
        let mut spec = LaunchSpec::new(self.worker_path()?, self.tag());
        spec.oom = self.worker.oom;
        spec.poll_secs = self.worker.poll_secs;
        spec.env = self.worker_env()?;
        spec.stderr_log = match &self.worker.log_file {
            Some(path) => Some(PathBuf::from(expand_env_vars(path)?)),
            None => None,
        };
        Ok(spec)
    }

    pub fn client_options(&self) -> Result<ClientOptions, SettingsError> {
        let stale_pattern = match &self.provision.stale_pattern {
            Some(pattern) => Some(Regex::new(pattern).map_err(|e| {
                SettingsError::InvalidConfig(format!("provision.stale_pattern: {}", e))
            })?),
            None => None,
        };

        Ok(ClientOptions {
            version: self.version(),
            call_timeout: Duration::from_millis(self.client.blocking_timeout_ms),
            provision_poll: Duration::from_millis(self.client.provision_poll_ms),
            stale_pattern,
            install_on_start: self.client.install_on_start,
        })
    }

    /// The configured provisioner; a no-op when no command is set.
    pub fn provisioner(&self) -> Result<Arc<dyn Provisioner>, SettingsError> {
        if self.provision.command.is_empty() {
            return Ok(Arc::new(NoopProvisioner));
        }

        let mut env = HashMap::new();
        for (key, value) in &self.provision.env {
            env.insert(key.clone(), expand_env_vars(value)?);
        }

        let mut provisioner = CommandProvisioner::new(self.provision.command.clone()).with_env(env);
        if let Some(dir) = &self.provision.dir {
            provisioner = provisioner.with_dir(expand_env_vars(dir)?);
        }
        Ok(Arc::new(provisioner))
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax. A `$` not followed by a name is kept.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    expand_with(s, |name| env::var(name).ok())
}

fn expand_with<F>(s: &str, lookup: F) -> Result<String, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = match after.strip_prefix('{') {
            Some(braced) => {
                let end = braced.find('}').ok_or_else(|| {
                    SettingsError::InvalidConfig(format!("unterminated `${{` in `{}`", s))
                })?;
                (&braced[..end], end + 2)
            }
            None => {
                let end = after
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(after.len());
                (&after[..end], end)
            }
        };

        if consumed == 0 {
            out.push('$');
        } else {
            let value = lookup(name).ok_or_else(|| SettingsError::MissingEnvVar(name.to_string()))?;
            out.push_str(&value);
        }
        rest = &after[consumed..];
    }

    out.push_str(rest);
    Ok(out)
}

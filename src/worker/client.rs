//! Public handle for talking to the supervised worker.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use super::codec;
use super::error::{WorkerError, WorkerResult};
use super::event::WorkerEvent;
use super::install::{InstallOutcome, Installer};
use super::pending::{Completion, PendingTable};
use super::protocol::{methods, DocParams, FmtParams, PkgParams, Reply};
use super::provision::{InstallState, ProvisionGate, Provisioner};
use super::receiver::ReceiverLoop;
use super::sender::{reject, Command, SenderLoop};
use super::supervisor::{LaunchSpec, Supervisor};
use crate::config::{Settings, SettingsError};

/// Default deadline for timed calls (1 second).
const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default interval between "still provisioning" checks.
const DEFAULT_PROVISION_POLL_MS: u64 = 100;

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 64;

/// Client-side knobs that are not part of the launch command.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Provisioning key; usually the crate or worker release.
    pub version: String,
    pub call_timeout: Duration,
    pub provision_poll: Duration,
    /// Old executables to remove after a successful install.
    pub stale_pattern: Option<Regex>,
    /// Run `install(false)` in the background as soon as the client starts.
    pub install_on_start: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            call_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            provision_poll: Duration::from_millis(DEFAULT_PROVISION_POLL_MS),
            stale_pattern: None,
            install_on_start: true,
        }
    }
}

/// Async request/response client for the worker process.
///
/// Requests are queued to a single sender task which starts (and restarts)
/// the worker as needed. Responses are matched to requests by token on a
/// single receiver task and handed to each request's [`Completion`].
///
/// # Example
///
/// ```ignore
/// use tether::config::Settings;
/// use tether::worker::WorkerClient;
///
/// let client = WorkerClient::start(&Settings::load()?).await?;
/// client.wait_until_installed().await;
///
/// let reply = client.call_timeout("fmt", params, Duration::from_secs(1)).await;
/// ```
pub struct WorkerClient {
    queue: mpsc::UnboundedSender<Command>,
    pending: Arc<PendingTable>,
    installer: Arc<Installer>,
    events: broadcast::Sender<WorkerEvent>,
    options: ClientOptions,
    _sender_task: JoinHandle<()>,
    _receiver_task: JoinHandle<()>,
}

impl WorkerClient {
    /// Start a client from settings.
    ///
    /// Must be called within a Tokio runtime.
    pub async fn start(settings: &Settings) -> Result<Self, SettingsError> {
        let launch = settings.launch_spec()?;
        let options = settings.client_options()?;
        let provisioner = settings.provisioner()?;
        Ok(Self::launch(launch, options, provisioner))
    }

    /// Start a client from explicit parts.
    ///
    /// Nothing is spawned until the first request arrives, except for the
    /// background install when `install_on_start` is set.
    pub fn launch(
        launch: LaunchSpec,
        options: ClientOptions,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pending = Arc::new(PendingTable::new());

        let mut installer = Installer::new(
            Arc::new(ProvisionGate::new()),
            provisioner,
            launch.exe.clone(),
            options.version.clone(),
            events.clone(),
        );
        if let Some(pattern) = &options.stale_pattern {
            installer = installer.with_stale_pattern(pattern.clone());
        }
        let installer = Arc::new(installer);

        let (lines_tx, lines_rx) = mpsc::unbounded_channel();
        let (queue, queue_rx) = mpsc::unbounded_channel();

        let receiver = ReceiverLoop::new(pending.clone(), launch.tag.clone(), events.clone());
        let receiver_task = tokio::spawn(receiver.run(lines_rx));

        let supervisor = Supervisor::new(
            launch,
            installer.clone(),
            lines_tx,
            events.clone(),
            options.provision_poll,
        );
        let sender_task = tokio::spawn(SenderLoop::new(supervisor, pending.clone()).run(queue_rx));

        let client = Self {
            queue,
            pending,
            installer,
            events,
            options,
            _sender_task: sender_task,
            _receiver_task: receiver_task,
        };

        if client.options.install_on_start {
            client.spawn_install(false);
        }

        client
    }

    // =========================================================================
    // Core API
    // =========================================================================

    /// Queue a request; `completion` receives the reply.
    ///
    /// Never blocks. If `params` cannot be serialized the completion is
    /// invoked immediately with an encode error and nothing is sent.
    pub fn call<P: Serialize>(&self, method: &str, params: P, completion: Completion) {
        match codec::encode_body(params) {
            Ok(args) => self.submit(method.to_string(), args, completion),
            Err(e) => reject(method, completion, e),
        }
    }

    fn submit(&self, method: String, args: Value, completion: Completion) {
        let command = Command::Call {
            method,
            args,
            completion,
        };
        if let Err(mpsc::error::SendError(command)) = self.queue.send(command) {
            if let Command::Call {
                method, completion, ..
            } = command
            {
                reject(&method, completion, WorkerError::Shutdown);
            }
        }
    }

    /// Call and wait for the reply on the current thread, up to `timeout`.
    ///
    /// Refused until installation is done. Do not call from inside an async
    /// task; use [`call_timeout`](Self::call_timeout) there. On timeout the
    /// request is left in flight and its eventual reply is discarded.
    pub fn call_blocking<P: Serialize>(&self, method: &str, params: P, timeout: Duration) -> Reply {
        if let Err(e) = self.check_ready(method) {
            return Reply::failed(e);
        }

        let (tx, rx) = std_mpsc::sync_channel(1);
        self.call(
            method,
            params,
            Completion::once(move |reply| {
                let _ = tx.try_send(reply);
            }),
        );

        match rx.recv_timeout(timeout) {
            Ok(reply) => reply,
            Err(std_mpsc::RecvTimeoutError::Timeout) => Reply::failed(WorkerError::Timeout {
                method: method.to_string(),
                timeout,
            }),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => Reply::failed(WorkerError::Shutdown),
        }
    }

    /// Async counterpart of [`call_blocking`](Self::call_blocking).
    pub async fn call_timeout<P: Serialize>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
    ) -> Reply {
        if let Err(e) = self.check_ready(method) {
            return Reply::failed(e);
        }

        let (tx, rx) = oneshot::channel();
        self.call(
            method,
            params,
            Completion::once(move |reply| {
                let _ = tx.send(reply);
            }),
        );

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Reply::failed(WorkerError::Shutdown),
            Err(_) => Reply::failed(WorkerError::Timeout {
                method: method.to_string(),
                timeout,
            }),
        }
    }

    /// Timed call with the configured deadline, decoding the payload.
    pub async fn request<P, R>(&self, method: &str, params: P) -> WorkerResult<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let data = self
            .call_timeout(method, params, self.options.call_timeout)
            .await
            .into_result()?;
        serde_json::from_value(data).map_err(WorkerError::Decode)
    }

    fn check_ready(&self, method: &str) -> WorkerResult<()> {
        if self.installer.state() == InstallState::Done {
            Ok(())
        } else {
            Err(WorkerError::NotReady {
                method: method.to_string(),
            })
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run the install attempt for the configured version.
    ///
    /// When a new executable was built, the running worker (if older) is
    /// restarted before the next request.
    pub async fn install(&self, force: bool) -> InstallOutcome {
        let outcome = self.installer.install(force).await;
        if let Some(built_at) = outcome.built_at() {
            let _ = self.queue.send(Command::Restart { built_at });
        }
        outcome
    }

    /// Claim the install attempt now and run it in the background, so the
    /// state reads `Busy` as soon as this returns.
    fn spawn_install(&self, force: bool) {
        let Some(ticket) = self.installer.try_begin() else {
            return;
        };
        let installer = self.installer.clone();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let outcome = installer.run(ticket, force).await;
            if let Some(built_at) = outcome.built_at() {
                let _ = queue.send(Command::Restart { built_at });
            }
        });
    }

    pub fn install_state(&self) -> InstallState {
        self.installer.state()
    }

    /// Wait until no install attempt is running.
    pub async fn wait_until_installed(&self) {
        self.installer.wait_while_busy(self.options.provision_poll).await
    }

    /// Run the install attempt if nobody has started it, then wait for it.
    ///
    /// After this returns, timed and blocking calls are no longer refused.
    pub async fn ensure_ready(&self) {
        if self.install_state() == InstallState::Unset {
            self.install(false).await;
        }
        self.wait_until_installed().await;
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    /// Subscribe to worker notices (starts, stops, tag mismatches, installs).
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Stop the worker and refuse further requests.
    pub fn shutdown(&self) {
        if self.queue.send(Command::Shutdown).is_err() {
            warn!("worker client already shut down");
        }
    }
}

impl Drop for WorkerClient {
    fn drop(&mut self) {
        let _ = self.queue.send(Command::Shutdown);
    }
}

// Convenience methods for common operations
impl WorkerClient {
    /// Round-trip an empty request.
    pub async fn ping(&self) -> WorkerResult<Value> {
        self.request(methods::PING, serde_json::json!({})).await
    }

    /// Format `src`; returns the formatted source.
    pub async fn fmt(
        &self,
        file: &str,
        src: &str,
        tab_indent: bool,
        tab_width: u32,
    ) -> WorkerResult<String> {
        let data: Value = self
            .request(
                methods::FMT,
                FmtParams {
                    file: file.to_string(),
                    src: src.to_string(),
                    tab_indent,
                    tab_width,
                },
            )
            .await?;
        Ok(data
            .get("src")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    /// Documentation for the identifier at `offset`, delivered to `completion`.
    pub fn doc(&self, file: &str, src: &str, offset: usize, completion: Completion) {
        self.call(
            methods::DOC,
            DocParams {
                file: file.to_string(),
                src: src.to_string(),
                offset,
            },
            completion,
        )
    }

    /// Package name declared by `src`.
    pub async fn pkg_name(&self, file: &str, src: &str) -> WorkerResult<Option<String>> {
        let data: Value = self
            .request(
                methods::PKG,
                PkgParams {
                    file: file.to_string(),
                    src: src.to_string(),
                },
            )
            .await?;
        Ok(data.get("name").and_then(Value::as_str).map(str::to_string))
    }
}

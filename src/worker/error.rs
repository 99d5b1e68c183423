//! Worker-specific error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that can be delivered to a caller or raised by the supervisor.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The request header or body could not be serialized.
    #[error("failed to construct ipc {part}: {source}")]
    Encode {
        /// Which half of the line failed ("header" or "body").
        part: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// A response line could not be parsed.
    #[error("failed to decode response: {0}")]
    Decode(#[source] serde_json::Error),

    /// The worker process could not be started.
    #[error("cannot start worker: {0}")]
    Spawn(#[source] io::Error),

    /// The worker started but was gone before the first request.
    #[error("worker exited immediately after start ({0})")]
    ExitedOnStart(String),

    /// Writing to the worker's stdin failed.
    #[error("cannot talk to worker: {0}")]
    Write(#[source] io::Error),

    /// A timed call did not receive its reply in time.
    #[error("call({method}) timed out after {timeout:?}")]
    Timeout {
        /// Method that was called.
        method: String,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// A timed call was attempted before installation finished.
    #[error("call({method}) aborted: install is not done")]
    NotReady {
        /// Method that was refused.
        method: String,
    },

    /// The request was dropped because the worker could not be brought up.
    #[error("abort: {0}")]
    Aborted(#[source] Box<WorkerError>),

    /// The worker answered with a non-empty error field.
    #[error("{0}")]
    Remote(String),

    /// The provisioning step failed.
    #[error("provisioning {version} failed: {message}")]
    Provision {
        /// Version that was being provisioned.
        version: String,
        /// Human-readable failure.
        message: String,
    },

    /// A fresh token collided with one still awaiting a reply.
    #[error("token {0} is already in flight")]
    DuplicateToken(String),

    /// The client was shut down before the request could be sent.
    #[error("worker client is shut down")]
    Shutdown,
}

impl WorkerError {
    /// Wrap a start failure so the caller can tell it was never sent.
    pub fn aborted(cause: WorkerError) -> Self {
        Self::Aborted(Box::new(cause))
    }

    /// Check if this error indicates the worker process went away.
    pub fn is_worker_exited(&self) -> bool {
        match self {
            Self::Write(_) | Self::ExitedOnStart(_) => true,
            Self::Aborted(inner) => inner.is_worker_exited(),
            _ => false,
        }
    }

    /// Check if issuing the same request again may succeed.
    ///
    /// Start and write failures force a restart on the next request, so
    /// they are worth retrying; remote and encoding errors are not.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Write(_) | Self::Spawn(_) | Self::ExitedOnStart(_) => true,
            Self::Aborted(inner) => inner.is_retriable(),
            _ => false,
        }
    }
}

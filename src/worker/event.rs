//! Notices published to observers of a [`WorkerClient`](super::WorkerClient).

/// Something the caller side may want to surface to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A worker process was launched.
    Started { pid: Option<u32> },
    /// The current worker process was released.
    Stopped,
    /// A response carried a tag other than the one we launched with.
    ///
    /// The response is still delivered; the worker and client are likely
    /// out of sync and a restart of the host is advisable.
    TagMismatch { expected: String, received: String },
    /// A provisioning attempt finished.
    Provisioned {
        version: String,
        error: Option<String>,
    },
}

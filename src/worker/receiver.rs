//! Reading worker stdout and delivering responses.
//!
//! A reader task per worker process turns stdout into raw lines on a shared
//! queue. One receiver loop drains that queue for the lifetime of the
//! client, so responses are delivered in arrival order across restarts.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::codec;
use super::event::WorkerEvent;
use super::pending::PendingTable;
use super::protocol::{Continuation, Reply};

/// Spawn the task that copies worker stdout onto `lines`, one line each.
///
/// The task ends at end-of-stream or on a read error, dropping the stream.
pub(crate) fn spawn_reader(
    stdout: ChildStdout,
    lines: mpsc::UnboundedSender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("worker stdout closed");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if lines.send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "worker read error");
                    break;
                }
            }
        }
    })
}

/// What happened to one raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Blank,
    Malformed,
    /// No pending request had this token.
    Unmatched,
    Delivered(Continuation),
    HandlerPanicked,
}

/// Routes decoded responses to their pending requests.
pub(crate) struct ReceiverLoop {
    pending: Arc<PendingTable>,
    expected_tag: String,
    events: broadcast::Sender<WorkerEvent>,
}

impl ReceiverLoop {
    pub fn new(
        pending: Arc<PendingTable>,
        expected_tag: impl Into<String>,
        events: broadcast::Sender<WorkerEvent>,
    ) -> Self {
        Self {
            pending,
            expected_tag: expected_tag.into(),
            events,
        }
    }

    /// Drain `lines` until every producer is gone.
    pub async fn run(self, mut lines: mpsc::UnboundedReceiver<String>) {
        while let Some(line) = lines.recv().await {
            self.dispatch(&line);
        }
        debug!("receiver loop finished");
    }

    pub fn dispatch(&self, raw: &str) -> Dispatch {
        let line = raw.trim();
        if line.is_empty() {
            return Dispatch::Blank;
        }

        let response = match codec::decode_response(line) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, line, "dropping malformed worker response");
                return Dispatch::Malformed;
            }
        };

        let Some(mut request) = self.pending.remove(&response.token) else {
            debug!(token = %response.token, "ignoring response for unknown token");
            return Dispatch::Unmatched;
        };

        if response.tag != self.expected_tag {
            warn!(
                expected = %self.expected_tag,
                received = %response.tag,
                "worker appears to be out of sync"
            );
            let _ = self.events.send(WorkerEvent::TagMismatch {
                expected: self.expected_tag.clone(),
                received: response.tag.clone(),
            });
        }

        debug!(
            method = %request.method,
            tag = %response.tag,
            token = %response.token,
            dur = ?request.submitted_at.elapsed(),
            err = %response.error,
            size = line.len(),
            "worker response"
        );

        let reply = Reply::from_response(codec::expand(response.data), response.error);
        match request.completion.invoke(&request.method, reply) {
            Some(Continuation::KeepOpen) => {
                request.submitted_at = std::time::Instant::now();
                if let Err(request) = self.pending.insert(response.token, request) {
                    warn!(method = %request.method, "token reused while a stream was open");
                }
                Dispatch::Delivered(Continuation::KeepOpen)
            }
            Some(Continuation::Close) => Dispatch::Delivered(Continuation::Close),
            None => Dispatch::HandlerPanicked,
        }
    }
}

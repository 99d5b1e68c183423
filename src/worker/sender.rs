//! The single writer to worker stdin.
//!
//! Commands are processed strictly in queue order, one at a time, so request
//! lines never interleave and reach the worker in submission order.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error};
use uuid::Uuid;

use super::codec;
use super::error::WorkerError;
use super::pending::{Completion, PendingRequest, PendingTable};
use super::protocol::Reply;
use super::supervisor::Supervisor;

/// Prefix of every correlation token.
pub const TOKEN_PREFIX: &str = "tether.token.";

/// Work item for the sender loop.
#[derive(Debug)]
pub(crate) enum Command {
    Call {
        method: String,
        args: Value,
        completion: Completion,
    },
    /// Stop the worker if it predates a fresh install.
    Restart { built_at: Instant },
    /// Stop the worker and exit the loop.
    Shutdown,
}

/// A fresh, process-unique correlation token.
pub fn new_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4())
}

/// Deliver an error to a completion that never got a token.
pub(crate) fn reject(method: &str, mut completion: Completion, error: WorkerError) {
    error!(method, error = %error, "request failed before sending");
    completion.invoke(method, Reply::failed(error));
}

pub(crate) struct SenderLoop {
    supervisor: Supervisor,
    pending: Arc<PendingTable>,
}

impl SenderLoop {
    pub fn new(supervisor: Supervisor, pending: Arc<PendingTable>) -> Self {
        Self {
            supervisor,
            pending,
        }
    }

    /// Process commands until shutdown or until every producer is gone.
    pub async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = queue.recv().await {
            match command {
                Command::Call {
                    method,
                    args,
                    completion,
                } => self.send(method, args, completion).await,
                Command::Restart { built_at } => self.supervisor.stop_if_started_before(built_at),
                Command::Shutdown => break,
            }
        }

        self.supervisor.stop();

        // anything queued behind the shutdown is refused
        queue.close();
        while let Ok(command) = queue.try_recv() {
            if let Command::Call {
                method, completion, ..
            } = command
            {
                reject(&method, completion, WorkerError::Shutdown);
            }
        }
        debug!("sender loop finished");
    }

    async fn send(&mut self, method: String, args: Value, completion: Completion) {
        let handle = match self.supervisor.ensure_alive().await {
            Ok(handle) => handle,
            Err(e) => {
                reject(&method, completion, WorkerError::aborted(e));
                return;
            }
        };

        let token = new_token();
        if !Self::register_in(&self.pending, &token, &method, completion) {
            return;
        }

        let line = match codec::encode_request(&method, &token, &args) {
            Ok(line) => line,
            Err(e) => {
                Self::fail(&self.pending, &token, e);
                return;
            }
        };

        debug!(%method, %token, "worker request");

        let written = handle.write_line(&line).await;
        if let Err(e) = written {
            Self::fail(&self.pending, &token, e);
            self.supervisor.stop();
        }
    }

    /// Record the request under `token`; a collision is reported to the
    /// handler and nothing is sent.
    #[cfg_attr(not(test), allow(dead_code))]
    fn register(&self, token: &str, method: &str, completion: Completion) -> bool {
        Self::register_in(&self.pending, token, method, completion)
    }

    fn register_in(
        pending: &PendingTable,
        token: &str,
        method: &str,
        completion: Completion,
    ) -> bool {
        match pending
            .insert(token.to_string(), PendingRequest::new(method, completion))
        {
            Ok(()) => true,
            Err(request) => {
                reject(
                    method,
                    request.completion,
                    WorkerError::DuplicateToken(token.to_string()),
                );
                false
            }
        }
    }

    /// Take `token` back out of the table and report `error` to its handler.
    fn fail(pending: &PendingTable, token: &str, error: WorkerError) {
        match pending.remove(token) {
            Some(mut request) => {
                error!(method = %request.method, %token, error = %error, "request not sent");
                request.completion.invoke(&request.method, Reply::failed(error));
            }
            None => debug!(%token, error = %error, "request already answered"),
        }
    }
}

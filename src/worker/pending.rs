//! Pending-request table shared by the sender and receiver loops.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use dashmap::DashMap;
use tracing::error;

use super::protocol::{Continuation, Reply};

type CompletionFn = Box<dyn FnMut(Reply) -> Continuation + Send + 'static>;

/// Callback invoked with a request's reply.
///
/// A handler may return [`Continuation::KeepOpen`] to stay registered for
/// further responses under the same token. Handlers only need to be `Send`;
/// the table is shared between tasks, so the closure sits behind a mutex that
/// is only ever reached through `&mut self`.
pub struct Completion(Mutex<CompletionFn>);

impl Completion {
    /// Wrap a handler that may be invoked more than once.
    pub fn new<F, R>(mut f: F) -> Self
    where
        F: FnMut(Reply) -> R + Send + 'static,
        R: Into<Continuation>,
    {
        Self(Mutex::new(Box::new(move |reply| f(reply).into())))
    }

    /// Wrap a single-shot handler. The token is always retired after it runs.
    pub fn once<F>(f: F) -> Self
    where
        F: FnOnce(Reply) + Send + 'static,
    {
        let mut f = Some(f);
        Self(Mutex::new(Box::new(move |reply| {
            if let Some(f) = f.take() {
                f(reply);
            }
            Continuation::Close
        })))
    }

    /// Run the handler, isolating the caller from a panic inside it.
    ///
    /// Returns `None` if the handler panicked.
    pub(crate) fn invoke(&mut self, method: &str, reply: Reply) -> Option<Continuation> {
        let handler = self.0.get_mut().unwrap_or_else(PoisonError::into_inner);
        match panic::catch_unwind(AssertUnwindSafe(|| handler(reply))) {
            Ok(next) => Some(next),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(method, panic = %message, "completion handler panicked");
                None
            }
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion(..)")
    }
}

/// A request that has been written (or is about to be) and awaits a reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub method: String,
    pub completion: Completion,
    pub submitted_at: Instant,
}

impl PendingRequest {
    pub fn new(method: impl Into<String>, completion: Completion) -> Self {
        Self {
            method: method.into(),
            completion,
            submitted_at: Instant::now(),
        }
    }
}

/// Map from correlation token to pending request.
///
/// Only the sender loop inserts and only the receiver loop removes on a
/// match; the sender takes an entry back out when its own write fails.
#[derive(Debug, Default)]
pub struct PendingTable {
    requests: DashMap<String, PendingRequest>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request under `token`, replacing nothing.
    ///
    /// Hands the request back if the token was already taken.
    pub fn insert(&self, token: String, request: PendingRequest) -> Result<(), PendingRequest> {
        match self.requests.entry(token) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(request),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(request);
                Ok(())
            }
        }
    }

    /// Take the request for `token` out of the table.
    pub fn remove(&self, token: &str) -> Option<PendingRequest> {
        self.requests.remove(token).map(|(_, request)| request)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.requests.contains_key(token)
    }

    /// Method name of the request registered under `token`.
    pub fn method_of(&self, token: &str) -> Option<String> {
        self.requests.get(token).map(|r| r.method.clone())
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

//! Protocol types for worker communication.
//!
//! A request is one line: `<header-json> <body-json>\n`. Every response is a
//! single JSON object carrying the request token back, plus the tag the
//! worker was launched with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::WorkerError;

// ============================================================================
// Request/Response Envelope
// ============================================================================

/// Header half of a request line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestHeader {
    /// Method name (e.g., "fmt").
    pub method: String,
    /// Correlation token echoed back by the worker.
    pub token: String,
}

/// Response record received from the worker.
///
/// Missing fields default to empty so a partial record still correlates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseEnvelope {
    /// Token of the request this answers.
    #[serde(default)]
    pub token: String,
    /// Protocol tag the worker was launched with.
    #[serde(default)]
    pub tag: String,
    /// Error message; empty means success.
    #[serde(default)]
    pub error: String,
    /// Method-specific payload.
    #[serde(default = "empty_object")]
    pub data: Value,
}

pub(crate) fn empty_object() -> Value {
    Value::Object(Default::default())
}

// ============================================================================
// Delivery
// ============================================================================

/// What a completion handler receives: the decoded payload and/or an error.
///
/// `data` is an empty object whenever the request never reached the worker.
#[derive(Debug)]
pub struct Reply {
    pub data: Value,
    pub error: Option<WorkerError>,
}

impl Reply {
    /// A successful reply.
    pub fn ok(data: Value) -> Self {
        Self { data, error: None }
    }

    /// A failed reply with an empty payload.
    pub fn failed(error: WorkerError) -> Self {
        Self {
            data: empty_object(),
            error: Some(error),
        }
    }

    /// Build a reply from a decoded (and expanded) response.
    pub fn from_response(data: Value, error: String) -> Self {
        let error = if error.is_empty() {
            None
        } else {
            Some(WorkerError::Remote(error))
        };
        Self { data, error }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a plain result, dropping `data` on error.
    pub fn into_result(self) -> Result<Value, WorkerError> {
        match self.error {
            None => Ok(self.data),
            Some(err) => Err(err),
        }
    }

    /// Error text as the worker would report it; empty on success.
    pub fn error_text(&self) -> String {
        self.error.as_ref().map(|e| e.to_string()).unwrap_or_default()
    }
}

/// Returned by a completion handler to decide whether its token stays open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Continuation {
    /// Retire the token; later responses for it are ignored.
    #[default]
    Close,
    /// Keep the token registered for further responses.
    KeepOpen,
}

impl From<()> for Continuation {
    fn from(_: ()) -> Self {
        Continuation::Close
    }
}

impl From<bool> for Continuation {
    fn from(keep: bool) -> Self {
        if keep {
            Continuation::KeepOpen
        } else {
            Continuation::Close
        }
    }
}

// ============================================================================
// Methods
// ============================================================================

/// Method names understood by the worker.
pub mod methods {
    pub const PING: &str = "ping";
    pub const FMT: &str = "fmt";
    pub const DOC: &str = "doc";
    pub const COMPLETE: &str = "complete";
    pub const PKG: &str = "pkg";
    pub const DECLARATIONS: &str = "declarations";
    pub const IMPORT_PATHS: &str = "import_paths";
}

/// Parameters for `fmt`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FmtParams {
    #[serde(rename = "fn")]
    pub file: String,
    pub src: String,
    pub tab_indent: bool,
    pub tab_width: u32,
}

/// Parameters for `doc`.
#[derive(Debug, Clone, Serialize)]
pub struct DocParams {
    #[serde(rename = "fn")]
    pub file: String,
    pub src: String,
    pub offset: usize,
}

/// Parameters for `pkg`.
#[derive(Debug, Clone, Serialize)]
pub struct PkgParams {
    #[serde(rename = "fn")]
    pub file: String,
    pub src: String,
}

//! Line codec for the worker protocol.
//!
//! Requests go out as `header SPACE body NEWLINE`; responses come back one
//! JSON object per line. Payload strings prefixed with `base64:` are
//! decoded on the way in by [`expand`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use super::error::{WorkerError, WorkerResult};
use super::protocol::{RequestHeader, ResponseEnvelope};

/// Marker for payload strings that carry base64-encoded text.
pub const BASE64_PREFIX: &str = "base64:";

/// Serialize request arguments into the body value.
pub fn encode_body<P: Serialize>(params: P) -> WorkerResult<Value> {
    serde_json::to_value(params).map_err(|source| WorkerError::Encode {
        part: "body",
        source,
    })
}

/// Build the full request line for `method` under `token`.
pub fn encode_request(method: &str, token: &str, args: &Value) -> WorkerResult<Vec<u8>> {
    let header = RequestHeader {
        method: method.to_string(),
        token: token.to_string(),
    };

    let mut line = serde_json::to_vec(&header).map_err(|source| WorkerError::Encode {
        part: "header",
        source,
    })?;
    line.push(b' ');
    serde_json::to_writer(&mut line, args).map_err(|source| WorkerError::Encode {
        part: "body",
        source,
    })?;
    line.push(b'\n');

    Ok(line)
}

/// Parse one response line.
pub fn decode_response(line: &str) -> WorkerResult<ResponseEnvelope> {
    serde_json::from_str(line.trim()).map_err(WorkerError::Decode)
}

/// Recursively replace every `base64:`-prefixed string with its decoded text.
///
/// A string that fails to decode becomes empty; the walk continues.
pub fn expand(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, expand(v))).collect()),
        Value::Array(items) => Value::Array(items.into_iter().map(expand).collect()),
        Value::String(s) => match s.strip_prefix(BASE64_PREFIX) {
            Some(encoded) => Value::String(decode_text(encoded)),
            None => Value::String(s),
        },
        other => other,
    }
}

fn decode_text(encoded: &str) -> String {
    match BASE64.decode(encoded) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!(error = %e, "invalid base64 payload in response, substituting empty string");
            String::new()
        }
    }
}

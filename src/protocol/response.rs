//! Correlated replies.

use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};

/// Marker message used when a reply body is not valid JSON
pub const DECODE_FAILURE_MESSAGE: &str = "Failed to parse response as JSON";

/// Body of a correlated reply
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The body parsed as JSON
    Decoded(Value),
    /// The body could not be parsed; raw bytes kept for debugging
    DecodeFailure {
        /// Body exactly as received
        raw: Bytes,
        /// Parser error
        error: String,
    },
}

/// A reply matched to the outstanding request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Correlation id the reply carried
    pub correlation_id: String,
    /// Decoded body, or the decode-failure record
    pub body: ResponseBody,
}

impl Response {
    /// Decode a matched reply body. Never fails: malformed bodies become
    /// [`ResponseBody::DecodeFailure`].
    pub fn decode(correlation_id: impl Into<String>, raw: Bytes) -> Self {
        let body = match serde_json::from_slice::<Value>(&raw) {
            Ok(value) => ResponseBody::Decoded(value),
            Err(e) => ResponseBody::DecodeFailure {
                raw,
                error: e.to_string(),
            },
        };
        Self {
            correlation_id: correlation_id.into(),
            body,
        }
    }

    /// Whether the remote sent non-conforming data
    pub fn is_decode_failure(&self) -> bool {
        matches!(self.body, ResponseBody::DecodeFailure { .. })
    }

    /// Decoded value, if the body parsed
    pub fn value(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Decoded(value) => Some(value),
            ResponseBody::DecodeFailure { .. } => None,
        }
    }

    /// Raw bytes of an undecodable body
    pub fn raw(&self) -> Option<&Bytes> {
        match &self.body {
            ResponseBody::Decoded(_) => None,
            ResponseBody::DecodeFailure { raw, .. } => Some(raw),
        }
    }

    /// Flatten into a single JSON value.
    ///
    /// Decode failures render as `{"error": ..., "raw": ...}`; `raw` is the
    /// body as text when it is UTF-8, otherwise `raw_base64` carries it.
    pub fn into_value(self) -> Value {
        match self.body {
            ResponseBody::Decoded(value) => value,
            ResponseBody::DecodeFailure { raw, error } => match std::str::from_utf8(&raw) {
                Ok(text) => json!({
                    "error": DECODE_FAILURE_MESSAGE,
                    "detail": error,
                    "raw": text,
                }),
                Err(_) => json!({
                    "error": DECODE_FAILURE_MESSAGE,
                    "detail": error,
                    "raw_base64": base64::engine::general_purpose::STANDARD.encode(&raw),
                }),
            },
        }
    }
}

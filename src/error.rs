//! ARCA RPC error types.
//!
//! Fatal conditions of a transaction are surfaced as [`RpcError`] after the
//! session has released its broker resources. A reply that arrived but could
//! not be decoded is *not* an error: it is delivered as a
//! [`ResponseBody::DecodeFailure`](crate::protocol::ResponseBody) value.

use std::time::Duration;

use thiserror::Error;

/// ARCA RPC errors.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The broker could not be reached (refused, unreachable, handshake timed out).
    #[error("Could not reach broker: {0}")]
    Connection(String),

    /// The broker was reached but a resource could not be acquired
    /// (authentication, channel exhaustion, queue declaration, publish).
    #[error("Broker transport error: {0}")]
    Transport(String),

    /// No matching reply arrived before the deadline.
    #[error("Reached broker but no response received after {} seconds", format_secs(*timeout))]
    Timeout {
        /// The configured timeout.
        timeout: Duration,
    },

    /// Invalid configuration or call arguments.
    #[error("Config error: {0}")]
    Config(String),

    /// Request payload rejected before anything was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for ARCA RPC operations
pub type Result<T> = std::result::Result<T, RpcError>;

impl RpcError {
    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether this error means the broker was never reached.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// Short, stable label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Transport(_) => "transport",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Json(_) => "json",
            Self::Io(_) => "io",
        }
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}

/// Render whole seconds without a fractional part ("30"), otherwise keep millis ("0.5").
fn format_secs(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        duration.as_secs().to_string()
    } else {
        format!("{}", duration.as_secs_f64())
    }
}

//! Correlation tokens.

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Opaque identifier binding a reply to the request that caused it.
///
/// Backed by a random (v4) UUID, so 122 bits of entropy; on the wire it is the
/// hyphenated lowercase string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    /// Generate a fresh random token
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Build a token from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes of the token
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Exact comparison against the `correlation_id` of an inbound message.
    ///
    /// Messages without a correlation id, or with one that is not exactly
    /// this token's wire form, never match.
    pub fn matches(&self, correlation_id: Option<&str>) -> bool {
        correlation_id.is_some_and(|id| id == self.to_string())
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for CorrelationToken {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

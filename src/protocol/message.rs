//! Broker messages for the request-reply exchange.
//!
//! Defines the envelope published to the broker (body + properties) and the
//! delivery handed to a consumer.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Content type set on JSON request/reply bodies
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Message properties relevant to the RPC protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Queue the reply must be delivered to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Token binding a reply to its request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// MIME type of the body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Timestamp (Unix millis)
    pub timestamp: u64,
}

impl MessageProperties {
    /// Set `reply_to`
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    /// Set `correlation_id`
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A message as published to the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Raw body
    pub body: Bytes,
    /// Protocol properties
    pub properties: MessageProperties,
}

impl Envelope {
    /// Create an envelope from raw bytes
    pub fn new(body: impl Into<Bytes>, properties: MessageProperties) -> Self {
        Self {
            body: body.into(),
            properties,
        }
    }

    /// Create a JSON envelope
    pub fn json<T: Serialize + ?Sized>(
        value: &T,
        properties: MessageProperties,
    ) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(value)?;
        let properties = MessageProperties {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            timestamp: current_timestamp(),
            ..properties
        };
        Ok(Self::new(body, properties))
    }

    /// Create a request envelope: JSON body tagged with a reply address and token
    pub fn request<T: Serialize + ?Sized>(
        value: &T,
        reply_to: &str,
        correlation_id: &str,
    ) -> Result<Self, serde_json::Error> {
        Self::json(
            value,
            MessageProperties::default()
                .with_reply_to(reply_to)
                .with_correlation_id(correlation_id),
        )
    }

    /// Correlation id carried by this message, if any
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    /// Reply address carried by this message, if any
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue the message was consumed from
    pub queue: String,
    /// Broker-assigned sequence number, per queue
    pub delivery_tag: u64,
    /// The message
    pub envelope: Envelope,
}

/// Get current timestamp in milliseconds
fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

//! Broker client abstraction.
//!
//! The broker itself is an external service. The RPC layer only needs a thin
//! slice of an AMQP-style client, captured by two traits:
//!
//! - [`Broker`]: opens connections from a [`BrokerConfig`]
//! - [`BrokerConnection`]: declares queues, consumes, publishes, closes
//!
//! Publishing uses default-exchange semantics: the routing key is the name of
//! the destination queue, and messages to a queue that does not exist are
//! dropped by the broker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        RpcClient / Responder            │
//! │          (Broker-Agnostic)              │
//! └──────────────────┬──────────────────────┘
//!                    │ dyn Broker
//!          ┌─────────┴─────────┐
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  MemoryBroker   │ │   AmqpBroker    │
//! │  (in-process)   │ │ (lapin, `amqp`) │
//! └─────────────────┘ └─────────────────┘
//! ```

#[cfg(feature = "amqp")]
mod amqp;
mod memory;

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConnection};
pub use memory::{MemoryBroker, MemoryConnection};

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::config::BrokerConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{Delivery, Envelope};

/// Boxed future returned by broker operations.
pub type BrokerFuture<'a, T> = BoxFuture<'a, Result<T>>;

/// Callback invoked for each message delivered to a consumer.
///
/// Runs on the broker's delivery path: it must record what it needs and
/// return without blocking.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Connection factory for a broker backend.
pub trait Broker: Send + Sync {
    /// Open a connection.
    ///
    /// Unreachable or refusing brokers yield [`RpcError::Connection`]; any
    /// other failure (authentication, limits) yields [`RpcError::Transport`].
    fn connect<'a>(&'a self, config: &'a BrokerConfig)
        -> BrokerFuture<'a, Box<dyn BrokerConnection>>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

/// An open broker connection with a single channel.
pub trait BrokerConnection: Send {
    /// Declare a shared, named queue. Idempotent.
    fn declare_queue<'a>(&'a mut self, name: &'a str) -> BrokerFuture<'a, ()>;

    /// Declare a server-named queue visible only to this connection and
    /// deleted when the connection closes. Returns the queue name.
    fn declare_exclusive_queue(&mut self) -> BrokerFuture<'_, String>;

    /// Start consuming `queue` with auto-acknowledgement.
    fn consume<'a>(&'a mut self, queue: &'a str, handler: DeliveryHandler)
        -> BrokerFuture<'a, ()>;

    /// Publish to the queue named by `routing_key`.
    fn publish<'a>(&'a mut self, routing_key: &'a str, envelope: Envelope)
        -> BrokerFuture<'a, ()>;

    /// Close the connection, dropping its consumers and exclusive queues.
    fn close(&mut self) -> BrokerFuture<'_, ()>;

    /// Whether [`close`](Self::close) has completed.
    fn is_closed(&self) -> bool;
}

/// Open a connection honouring the handshake timeout and attempt count.
///
/// Only [`RpcError::Connection`] failures are attempted again; a transport
/// failure (e.g. bad credentials) will not improve with another attempt.
pub async fn connect(
    broker: &dyn Broker,
    config: &BrokerConfig,
) -> Result<Box<dyn BrokerConnection>> {
    let attempts = config.connection_attempts.max(1);
    let mut attempt = 1;

    loop {
        tracing::debug!(
            "Connecting to {} via {} (attempt {}/{})",
            config.redacted_uri(),
            broker.name(),
            attempt,
            attempts
        );

        let result = match tokio::time::timeout(config.connection_timeout(), broker.connect(config))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(RpcError::Connection(format!(
                "handshake with {} timed out after {:?}",
                config.address(),
                config.connection_timeout()
            ))),
        };

        match result {
            Err(RpcError::Connection(reason)) if attempt < attempts => {
                tracing::warn!(
                    "Connection attempt {}/{} failed: {}",
                    attempt,
                    attempts,
                    reason
                );
                tokio::time::sleep(config.retry_delay()).await;
                attempt += 1;
            },
            other => return other,
        }
    }
}

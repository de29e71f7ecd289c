//! Session manager for a single request-reply transaction.
//!
//! Each call to [`RpcClient::execute`] runs one transaction:
//!
//! ```text
//!   connect ──> declare exclusive reply queue ──> consume(listener)
//!      │                                              │
//!      │ [Initiated]                                  v
//!      │                                publish(request_queue, reply_to,
//!      │                                        correlation_id)
//!      │                                              │ [Awaiting]
//!      │                                              v
//!      │                               await match / deadline
//!      │                                              │
//!      v                                              v
//!   close  <──── [Completed | TimedOut | Failed] ─────┘
//! ```
//!
//! The connection is held by a [`ConnectionGuard`]. It is released exactly
//! once: explicitly after the transaction body returns (whatever the
//! outcome), or from `Drop` if the caller's future is cancelled mid-flight.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use super::waiter::{CorrelationWaiter, Deadline, WaitStrategy};
use crate::broker::{self, Broker, BrokerConnection};
use crate::config::Config;
use crate::error::{Result, RpcError};
use crate::protocol::{Envelope, Response};

/// Lifecycle of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Connection and reply queue acquired, request not yet sent
    Initiated,
    /// Request sent, waiting for the correlated reply
    Awaiting,
    /// Reply matched
    Completed,
    /// Deadline passed without a match
    TimedOut,
    /// Broker or resource failure
    Failed,
}

impl TransactionState {
    /// Whether this state ends the transaction
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::TimedOut | Self::Failed)
    }

    /// Terminal state for a transaction outcome
    pub fn from_outcome<T>(outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => Self::Completed,
            Err(RpcError::Timeout { .. }) => Self::TimedOut,
            Err(_) => Self::Failed,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initiated => "initiated",
            Self::Awaiting => "awaiting",
            Self::Completed => "completed",
            Self::TimedOut => "timed_out",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Owns a broker connection for the duration of a scope.
pub struct ConnectionGuard {
    connection: Option<Box<dyn BrokerConnection>>,
}

impl ConnectionGuard {
    /// Open a connection.
    pub async fn acquire(broker: &dyn Broker, config: &Config) -> Result<Self> {
        let connection = broker::connect(broker, &config.broker).await?;
        Ok(Self {
            connection: Some(connection),
        })
    }

    /// The held connection
    pub fn connection(&mut self) -> Result<&mut dyn BrokerConnection> {
        match self.connection.as_mut() {
            Some(connection) => Ok(connection.as_mut()),
            None => Err(RpcError::Transport("connection already released".to_string())),
        }
    }

    /// Close the connection now.
    pub async fn release(mut self) -> Result<()> {
        match self.connection.take() {
            Some(mut connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(mut connection) = self.connection.take() else {
            return;
        };
        tracing::warn!("Connection dropped before release, closing in background");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = connection.close().await {
                        tracing::warn!("Background close failed: {}", e);
                    }
                });
            },
            Err(_) => tracing::error!("No runtime available; connection leaked until broker timeout"),
        }
    }
}

/// Client side of the request-reply protocol.
#[derive(Clone)]
pub struct RpcClient {
    broker: Arc<dyn Broker>,
    config: Config,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("broker", &self.broker.name())
            .field("config", &self.config)
            .finish()
    }
}

impl RpcClient {
    /// Create a client
    pub fn new(broker: Arc<dyn Broker>, config: Config) -> Self {
        Self { broker, config }
    }

    /// Client configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one transaction with the configured default timeout.
    pub async fn call<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Response> {
        self.execute(payload, self.config.rpc.timeout()).await
    }

    /// Run one transaction: publish `payload` and wait up to `timeout` for
    /// the correlated reply.
    ///
    /// `payload` must serialize to a JSON object. Nothing is published if the
    /// arguments are invalid or resources cannot be acquired.
    pub async fn execute<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        timeout: Duration,
    ) -> Result<Response> {
        if timeout.is_zero() {
            return Err(RpcError::Config("timeout must be positive".to_string()));
        }
        let body = serde_json::to_value(payload)?;
        if !body.is_object() {
            return Err(RpcError::InvalidRequest(
                "payload must serialize to a JSON object".to_string(),
            ));
        }

        let mut guard = ConnectionGuard::acquire(self.broker.as_ref(), &self.config).await?;
        let outcome = match guard.connection() {
            Ok(connection) => self.transact(connection, &body, timeout).await,
            Err(e) => Err(e),
        };
        if let Err(e) = guard.release().await {
            tracing::warn!("Failed to close broker connection: {}", e);
        }

        let state = TransactionState::from_outcome(&outcome);
        match &outcome {
            Ok(response) if response.is_decode_failure() => tracing::warn!(
                "Transaction {}: reply {} was not valid JSON",
                state,
                response.correlation_id
            ),
            Ok(response) => tracing::info!("Transaction {}: reply {}", state, response.correlation_id),
            Err(e) => tracing::warn!("Transaction {} ({}): {}", state, e.kind(), e),
        }
        outcome
    }

    async fn transact(
        &self,
        connection: &mut dyn BrokerConnection,
        body: &Value,
        timeout: Duration,
    ) -> Result<Response> {
        let reply_queue = connection.declare_exclusive_queue().await?;
        let waiter = CorrelationWaiter::new();
        connection.consume(&reply_queue, waiter.listener()).await?;
        let token = waiter.token();
        tracing::debug!(
            "Transaction {}: reply queue '{}', token {}",
            TransactionState::Initiated,
            reply_queue,
            token
        );

        let request = Envelope::request(body, &reply_queue, &token.to_string())?;
        connection
            .publish(&self.config.rpc.request_queue, request)
            .await?;
        let deadline = Deadline::after(timeout);
        tracing::info!(
            "Transaction {}: sent request to '{}', waiting up to {:?}",
            TransactionState::Awaiting,
            self.config.rpc.request_queue,
            timeout
        );

        waiter
            .await_match(deadline, WaitStrategy::from(&self.config.rpc))
            .await
    }
}

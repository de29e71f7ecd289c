//! # ARCA RPC - last-invoice lookups over a message broker
//!
//! Client and service halves of a correlation-based request-reply protocol
//! running on an AMQP-style broker. The client publishes a request carrying
//! billing identifiers, waits on a private reply queue for the message that
//! carries its correlation token, and returns it or fails with a timeout.
//!
//! ## Transaction
//!
//! ```text
//! Client                          Broker                         Service
//!    |                               |                               |
//!    |-- connect ------------------->|                               |
//!    |-- declare exclusive queue --->|  amq.gen-…                    |
//!    |-- consume(amq.gen-…) -------->|                               |
//!    |-- publish("arca",             |                               |
//!    |     reply_to=amq.gen-…,       |                               |
//!    |     correlation_id=<uuid>) -->|------- request -------------->|
//!    |                               |<------ publish(amq.gen-…,     |
//!    |<------ reply -----------------|        correlation_id=<uuid>) |
//!    |-- close --------------------->|  (reply queue deleted)        |
//! ```
//!
//! ## Outcomes
//!
//! | Outcome                           | Result                                   |
//! |-----------------------------------|------------------------------------------|
//! | Matching JSON reply               | `Ok(Response)` with `ResponseBody::Decoded` |
//! | Matching non-JSON reply           | `Ok(Response)` with `ResponseBody::DecodeFailure` |
//! | No matching reply before deadline | `Err(RpcError::Timeout)`                 |
//! | Broker unreachable                | `Err(RpcError::Connection)`              |
//! | Auth / channel / publish failure  | `Err(RpcError::Transport)`               |
//!
//! The connection, reply queue and listener are released exactly once in
//! every case.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use arca_rpc::{broker::MemoryBroker, Config, RpcClient};
//!
//! let client = RpcClient::new(Arc::new(MemoryBroker::new()), Config::from_env());
//! let response = client
//!     .request_last_invoice("23146234399", "0001", "001", None)
//!     .await?;
//! println!("{}", response.into_value());
//! ```
//!
//! ## Modules
//!
//! - [`rpc`]: session manager, correlation waiter, responder
//! - [`protocol`]: envelopes, correlation tokens, responses
//! - [`broker`]: broker client traits, the in-memory broker and, with the
//!   `amqp` feature, the network backend
//! - [`invoice`]: last-invoice request type and service adapter
//! - [`config`]: configuration management
//! - [`error`]: error types and result aliases

pub mod broker;
pub mod config;
pub mod error;
pub mod invoice;
pub mod protocol;
pub mod rpc;

// Re-exports for convenience
#[cfg(feature = "amqp")]
pub use broker::AmqpBroker;
pub use broker::{Broker, BrokerConnection, MemoryBroker};
pub use config::{BrokerConfig, Config, RpcConfig, WaitMode};
pub use error::{Result, RpcError};
pub use invoice::{LastInvoiceRequest, LastInvoiceService};
pub use protocol::{CorrelationToken, Envelope, Response, ResponseBody};
pub use rpc::{CorrelationWaiter, RequestHandler, Responder, RpcClient, TransactionState, WaitStrategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Queue the invoice service consumes requests from
pub const DEFAULT_REQUEST_QUEUE: &str = "arca";

//! Request-reply over the broker.
//!
//! - [`RpcClient`]: session manager, one transaction per call
//! - [`CorrelationWaiter`]: token matching and the bounded wait
//! - [`Responder`]: the service side, answering the request queue
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use arca_rpc::{broker::MemoryBroker, Config, RpcClient};
//!
//! let client = RpcClient::new(Arc::new(MemoryBroker::new()), Config::default());
//! let response = client
//!     .execute(&serde_json::json!({"cuit": "23146234399"}), Duration::from_secs(30))
//!     .await?;
//! ```

mod responder;
mod session;
mod waiter;

pub use responder::{BoundResponder, HandlerFuture, RequestHandler, Responder, ResponderStats};
pub use session::{ConnectionGuard, RpcClient, TransactionState};
pub use waiter::{CorrelationWaiter, Deadline, WaitStrategy};

//! Wire-level pieces of the request-reply protocol.
//!
//! A request is a JSON body published to a well-known queue with two
//! properties: `reply_to` (an exclusive queue owned by the caller) and
//! `correlation_id` (a fresh random token). The remote service publishes its
//! reply to `reply_to`, echoing `correlation_id`.
//!
//! ```text
//! Client                         Broker                        Service
//!    |                              |                              |
//!    |-- declare exclusive queue -->|                              |
//!    |-- consume(reply queue) ----->|                              |
//!    |-- publish(arca, reply_to,    |                              |
//!    |           correlation_id) -->|------- deliver request ----->|
//!    |                              |<-- publish(reply_to, same    |
//!    |<------ deliver reply --------|        correlation_id) ------|
//!    |-- close (queue deleted) ---->|                              |
//! ```
//!
//! Replies whose `correlation_id` differs from the outstanding token are
//! ignored; they belong to some other transaction.

mod message;
mod response;
mod token;

pub use message::{Delivery, Envelope, MessageProperties, CONTENT_TYPE_JSON};
pub use response::{Response, ResponseBody, DECODE_FAILURE_MESSAGE};
pub use token::CorrelationToken;

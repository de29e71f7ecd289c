//! Service side of the request-reply protocol.
//!
//! A [`Responder`] consumes the well-known request queue and answers every
//! request on its `reply_to` queue, echoing the `correlation_id`:
//!
//! | Outcome                     | Reply body                 |
//! |-----------------------------|----------------------------|
//! | Handler succeeded           | `{"response": <value>}`    |
//! | Empty / non-JSON body       | `{"error": "<reason>"}`    |
//! | Handler failed              | `{"error": "<reason>"}`    |
//!
//! Requests without `reply_to` are handled but cannot be answered; they are
//! logged and counted.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::session::ConnectionGuard;
use crate::broker::{Broker, BrokerConnection, DeliveryHandler};
use crate::config::Config;
use crate::error::Result;
use crate::protocol::{Delivery, Envelope, MessageProperties};

/// Boxed future returned by request handlers.
pub type HandlerFuture<'a> = BoxFuture<'a, std::result::Result<Value, String>>;

/// Application logic behind the request queue.
pub trait RequestHandler: Send + Sync {
    /// Produce the reply payload for a decoded request, or an error message
    /// to send back instead.
    fn handle<'a>(&'a self, request: &'a Value) -> HandlerFuture<'a>;
}

/// Counters for a responder run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponderStats {
    /// Requests consumed
    pub received: u64,
    /// Replies carrying `response`
    pub answered: u64,
    /// Replies carrying `error`
    pub errors: u64,
    /// Requests that could not be answered (no `reply_to`, publish failure,
    /// shutdown while the handler was running)
    pub unanswered: u64,
}

/// Request queue consumer that replies to each request.
pub struct Responder<H> {
    broker: Arc<dyn Broker>,
    config: Config,
    handler: H,
}

impl<H: RequestHandler> Responder<H> {
    /// Create a responder
    pub fn new(broker: Arc<dyn Broker>, config: Config, handler: H) -> Self {
        Self {
            broker,
            config,
            handler,
        }
    }

    /// Connect, declare the request queue and start consuming it.
    ///
    /// Requests published after this returns are buffered until
    /// [`BoundResponder::run`] processes them.
    pub async fn bind(self) -> Result<BoundResponder<H>> {
        let mut guard = ConnectionGuard::acquire(self.broker.as_ref(), &self.config).await?;
        let queue = self.config.rpc.request_queue.clone();
        let (sender, receiver) = mpsc::unbounded_channel();

        let connection = guard.connection()?;
        connection.declare_queue(&queue).await?;
        let listener: DeliveryHandler = Arc::new(move |delivery: Delivery| {
            let _ = sender.send(delivery);
        });
        connection.consume(&queue, listener).await?;
        tracing::info!("Responder consuming '{}' via {}", queue, self.broker.name());

        Ok(BoundResponder {
            guard,
            receiver,
            handler: self.handler,
            queue,
            stats: ResponderStats::default(),
        })
    }
}

/// A responder that is consuming its queue.
pub struct BoundResponder<H> {
    guard: ConnectionGuard,
    receiver: mpsc::UnboundedReceiver<Delivery>,
    handler: H,
    queue: String,
    stats: ResponderStats,
}

impl<H: RequestHandler> BoundResponder<H> {
    /// Queue being consumed
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Answer requests until `shutdown` resolves, then release the connection.
    pub async fn run<S>(mut self, shutdown: S) -> Result<ResponderStats>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => break,
                delivery = self.receiver.recv() => match delivery {
                    Some(delivery) => {
                        let tag = delivery.delivery_tag;
                        self.stats.received += 1;
                        let connection = self.guard.connection()?;
                        tokio::select! {
                            biased;
                            () = &mut shutdown => {
                                tracing::warn!(
                                    "Responder on '{}' stopping while request #{} is in flight",
                                    self.queue,
                                    tag
                                );
                                self.stats.unanswered += 1;
                                break;
                            },
                            () = answer(connection, &self.handler, delivery, &mut self.stats) => {},
                        }
                    },
                    None => break,
                },
            }
        }

        tracing::info!(
            "Responder on '{}' stopping: {} received, {} answered, {} errors, {} unanswered",
            self.queue,
            self.stats.received,
            self.stats.answered,
            self.stats.errors,
            self.stats.unanswered
        );
        let stats = self.stats;
        self.guard.release().await?;
        Ok(stats)
    }
}

async fn answer<H: RequestHandler>(
    connection: &mut dyn BrokerConnection,
    handler: &H,
    delivery: Delivery,
    stats: &mut ResponderStats,
) {
    let envelope = delivery.envelope;

    let reply = match decode_request(&envelope.body) {
        Ok(request) => match handler.handle(&request).await {
            Ok(value) => json!({ "response": value }),
            Err(reason) => json!({ "error": reason }),
        },
        Err(reason) => json!({ "error": reason }),
    };
    let is_error = reply.get("error").is_some();

    let Some(reply_to) = envelope.reply_to() else {
        tracing::warn!(
            "Request #{} on '{}' has no reply_to; response not sent",
            delivery.delivery_tag,
            delivery.queue
        );
        stats.unanswered += 1;
        return;
    };

    let mut properties = MessageProperties::default();
    properties.correlation_id = envelope.properties.correlation_id.clone();
    let published = match Envelope::json(&reply, properties) {
        Ok(message) => connection.publish(reply_to, message).await,
        Err(e) => Err(e.into()),
    };

    match published {
        Ok(()) if is_error => stats.errors += 1,
        Ok(()) => {
            tracing::debug!("Answered request #{} to '{}'", delivery.delivery_tag, reply_to);
            stats.answered += 1;
        },
        Err(e) => {
            tracing::warn!("Error sending response to '{}': {}", reply_to, e);
            stats.unanswered += 1;
        },
    }
}

fn decode_request(body: &[u8]) -> std::result::Result<Value, String> {
    if body.is_empty() {
        return Err("Empty message body received".to_string());
    }
    serde_json::from_slice(body).map_err(|e| {
        format!(
            "Invalid JSON in message body: {} ({e})",
            String::from_utf8_lossy(body)
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_request() {
        assert_eq!(decode_request(br#"{"a": 1}"#).unwrap()["a"], 1);
        assert_eq!(
            decode_request(b"").unwrap_err(),
            "Empty message body received"
        );
        assert!(decode_request(b"{oops")
            .unwrap_err()
            .starts_with("Invalid JSON in message body: {oops"));
    }
}

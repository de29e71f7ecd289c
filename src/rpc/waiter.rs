//! Correlation waiter: token, listener, bounded wait.
//!
//! The listener handed to the broker runs on the delivery path. It compares
//! each message's `correlation_id` with the outstanding token, ignores
//! everything that does not match, and moves the first match into a
//! single-slot handoff. [`CorrelationWaiter::await_match`] suspends the caller
//! on that slot until the deadline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::broker::DeliveryHandler;
use crate::config::{RpcConfig, WaitMode};
use crate::error::{Result, RpcError};
use crate::protocol::{CorrelationToken, Delivery, Response};

/// How the caller waits for the reply slot to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Suspend until the slot fills or the deadline passes
    #[default]
    Event,
    /// Re-check the slot at a fixed interval.
    ///
    /// Adds up to one interval of latency after arrival and up to one
    /// interval of delay before a timeout is noticed.
    Poll(Duration),
}

impl From<&RpcConfig> for WaitStrategy {
    fn from(config: &RpcConfig) -> Self {
        match config.wait {
            WaitMode::Event => Self::Event,
            WaitMode::Poll => Self::Poll(config.poll_interval()),
        }
    }
}

/// Stand-in for timeouts too large to add to the clock (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Absolute deadline for a wait, plus the timeout it was derived from.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now.
    ///
    /// Timeouts past the clock's range are clamped to a far-future instant.
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            at: now.checked_add(timeout).unwrap_or(now + FAR_FUTURE),
            timeout,
        }
    }

    /// Instant the wait gives up
    pub fn at(&self) -> Instant {
        self.at
    }

    /// Configured timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn expired(&self) -> RpcError {
        RpcError::Timeout {
            timeout: self.timeout,
        }
    }
}

type Slot = Arc<Mutex<Option<oneshot::Sender<Bytes>>>>;

/// Matches inbound replies against one correlation token.
#[derive(Debug)]
pub struct CorrelationWaiter {
    token: CorrelationToken,
    slot: Slot,
    receiver: oneshot::Receiver<Bytes>,
    ignored: Arc<AtomicU64>,
}

impl Default for CorrelationWaiter {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationWaiter {
    /// Create a waiter with a freshly generated token
    pub fn new() -> Self {
        Self::with_token(CorrelationToken::generate())
    }

    /// Create a waiter for a known token
    pub fn with_token(token: CorrelationToken) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            token,
            slot: Arc::new(Mutex::new(Some(sender))),
            receiver,
            ignored: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Token replies must carry
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Number of deliveries ignored so far (wrong or missing token, duplicates)
    pub fn ignored(&self) -> u64 {
        self.ignored.load(Ordering::SeqCst)
    }

    /// Delivery callback to register with the broker.
    pub fn listener(&self) -> DeliveryHandler {
        let token = self.token;
        let slot = self.slot.clone();
        let ignored = self.ignored.clone();

        Arc::new(move |delivery: Delivery| {
            let envelope = delivery.envelope;
            if !token.matches(envelope.correlation_id()) {
                ignored.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(
                    "Ignoring reply on '{}' with correlation id {:?} (waiting for {})",
                    delivery.queue,
                    envelope.correlation_id(),
                    token
                );
                return;
            }

            let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            match sender {
                Some(sender) => {
                    tracing::debug!("Matched reply for {} ({} bytes)", token, envelope.body.len());
                    let _ = sender.send(envelope.body);
                },
                None => {
                    ignored.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!("Ignoring duplicate reply for {}", token);
                },
            }
        })
    }

    /// Wait for the matching reply.
    ///
    /// A reply already in the slot when the deadline passes is returned
    /// rather than reported as a timeout.
    pub async fn await_match(self, deadline: Deadline, strategy: WaitStrategy) -> Result<Response> {
        let correlation_id = self.token.to_string();
        let mut receiver = self.receiver;

        let body = match strategy {
            WaitStrategy::Event => {
                match tokio::time::timeout_at(deadline.at(), &mut receiver).await {
                    Ok(Ok(body)) => body,
                    Ok(Err(_)) => {
                        return Err(RpcError::Transport(
                            "reply listener dropped before a reply arrived".to_string(),
                        ))
                    },
                    Err(_) => receiver.try_recv().map_err(|_| deadline.expired())?,
                }
            },
            WaitStrategy::Poll(interval) => loop {
                match receiver.try_recv() {
                    Ok(body) => break body,
                    Err(oneshot::error::TryRecvError::Closed) => {
                        return Err(RpcError::Transport(
                            "reply listener dropped before a reply arrived".to_string(),
                        ))
                    },
                    Err(oneshot::error::TryRecvError::Empty) => {},
                }
                if Instant::now() > deadline.at() {
                    return Err(deadline.expired());
                }
                tokio::time::sleep(interval).await;
            },
        };

        Ok(Response::decode(correlation_id, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, MessageProperties};

    fn reply(correlation_id: Option<&str>, body: &'static [u8]) -> Delivery {
        let mut properties = MessageProperties::default();
        properties.correlation_id = correlation_id.map(str::to_string);
        Delivery {
            queue: "amq.gen-test".to_string(),
            delivery_tag: 1,
            envelope: Envelope::new(body, properties),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_matching_reply_is_returned() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();

        listener(reply(Some(&id), br#"{"invoice_number": 7}"#));

        let response = waiter
            .await_match(Deadline::after(Duration::from_secs(1)), WaitStrategy::Event)
            .await
            .unwrap();
        assert_eq!(response.correlation_id, id);
        assert_eq!(response.value().unwrap()["invoice_number"], 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_replies_ignored() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let other = CorrelationToken::generate().to_string();

        listener(reply(Some(&other), b"{}"));
        listener(reply(None, b"{}"));
        assert_eq!(waiter.ignored(), 2);

        let err = waiter
            .await_match(Deadline::after(Duration::from_secs(3)), WaitStrategy::Event)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { timeout } if timeout == Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_match_wins() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();

        listener(reply(Some(&id), br#"{"n": 1}"#));
        listener(reply(Some(&id), br#"{"n": 2}"#));
        assert_eq!(waiter.ignored(), 1);

        let response = waiter
            .await_match(Deadline::after(Duration::from_secs(1)), WaitStrategy::Event)
            .await
            .unwrap();
        assert_eq!(response.value().unwrap()["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_match_beats_expired_deadline() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();
        let deadline = Deadline::after(Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        listener(reply(Some(&id), b"{}"));

        let response = waiter.await_match(deadline, WaitStrategy::Event).await;
        assert!(response.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_pending_match_beats_expired_deadline() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();
        let deadline = Deadline::after(Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        listener(reply(Some(&id), b"{}"));

        let response = waiter
            .await_match(deadline, WaitStrategy::Poll(Duration::from_secs(1)))
            .await;
        assert!(response.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_wait_wakes_on_arrival() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            listener(reply(Some(&id), b"[1, 2]"));
        });

        let response = waiter
            .await_match(Deadline::after(Duration::from_secs(30)), WaitStrategy::Event)
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(310));
        assert!(response.value().unwrap().is_array());
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_wakes_pending_wait() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();

        let mut wait = task::spawn(
            waiter.await_match(Deadline::after(Duration::from_secs(30)), WaitStrategy::Event),
        );
        assert_pending!(wait.poll());

        listener(reply(Some(&CorrelationToken::generate().to_string()), b"{}"));
        assert!(!wait.is_woken());

        listener(reply(Some(&id), br#"{"n": 1}"#));
        assert!(wait.is_woken());
        let response = assert_ready_ok!(wait.poll());
        assert_eq!(response.value().unwrap()["n"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_wait_adds_at_most_one_interval() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();
        let start = Instant::now();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            listener(reply(Some(&id), b"{}"));
        });

        waiter
            .await_match(
                Deadline::after(Duration::from_secs(30)),
                WaitStrategy::Poll(Duration::from_secs(1)),
            )
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_millis(1010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_timeout() {
        let waiter = CorrelationWaiter::new();
        let start = Instant::now();

        let err = waiter
            .await_match(
                Deadline::after(Duration::from_secs(2)),
                WaitStrategy::Poll(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // t=2 is not past the deadline yet, the next tick at t=3 is
        let elapsed = start.elapsed();
        assert!(elapsed > Duration::from_secs(2));
        assert!(elapsed < Duration::from_millis(3010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_accepts_reply_found_exactly_at_deadline() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            listener(reply(Some(&id), b"{}"));
        });

        // at t=2 elapsed equals the timeout without exceeding it, so t=3 still checks the slot
        let response = waiter
            .await_match(
                Deadline::after(Duration::from_secs(2)),
                WaitStrategy::Poll(Duration::from_secs(1)),
            )
            .await;
        assert!(response.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_is_clamped() {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline.timeout(), Duration::MAX);
        assert!(deadline.at() > Instant::now() + Duration::from_secs(86_400 * 365));

        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();
        listener(reply(Some(&id), b"{}"));
        assert!(waiter.await_match(deadline, WaitStrategy::Event).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_match_is_a_value() {
        let waiter = CorrelationWaiter::new();
        let listener = waiter.listener();
        let id = waiter.token().to_string();

        listener(reply(Some(&id), b"not json"));

        let response = waiter
            .await_match(Deadline::after(Duration::from_secs(1)), WaitStrategy::Event)
            .await
            .unwrap();
        assert!(response.is_decode_failure());
        assert_eq!(&response.raw().unwrap()[..], b"not json");
    }

    #[test]
    fn test_strategy_from_config() {
        let mut config = RpcConfig::default();
        assert_eq!(WaitStrategy::from(&config), WaitStrategy::Event);

        config.wait = WaitMode::Poll;
        config.poll_interval_ms = 500;
        assert_eq!(
            WaitStrategy::from(&config),
            WaitStrategy::Poll(Duration::from_millis(500))
        );
    }
}

//! In-process broker.
//!
//! Implements the default-exchange subset of AMQP that the RPC layer relies
//! on: named and exclusive server-named queues, one auto-ack consumer per
//! queue, and a backlog for messages published before a consumer attaches.
//! Exclusive queues and consumers are removed when their connection closes.
//!
//! Also records connection statistics and can inject faults, which is what
//! the session tests and the demo binary use it for.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Broker, BrokerConnection, BrokerFuture, DeliveryHandler};
use crate::config::BrokerConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{Delivery, Envelope};

/// Prefix of server-generated queue names
const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

struct Queue {
    /// Owning connection for exclusive queues
    owner: Option<u64>,
    /// Consuming connection and its callback
    consumer: Option<(u64, DeliveryHandler)>,
    /// Messages waiting for a consumer
    backlog: VecDeque<Envelope>,
    /// Next delivery tag
    next_tag: u64,
}

impl Queue {
    fn new(owner: Option<u64>) -> Self {
        Self {
            owner,
            consumer: None,
            backlog: VecDeque::new(),
            next_tag: 1,
        }
    }

    fn delivery(&mut self, name: &str, envelope: Envelope) -> Delivery {
        let delivery_tag = self.next_tag;
        self.next_tag += 1;
        Delivery {
            queue: name.to_string(),
            delivery_tag,
            envelope,
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    open_connections: HashSet<u64>,
    next_connection_id: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    refuse_connections: AtomicBool,
    fail_publish: AtomicBool,
    credentials: Mutex<Option<(String, String)>>,
    connection_attempts: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process broker. Cheap to clone; clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("open_connections", &self.open_connections())
            .field("queues", &self.queue_names())
            .finish()
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect; others fail with a transport error
    pub fn with_credentials(self, username: &str, password: &str) -> Self {
        *self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            Some((username.to_string(), password.to_string()));
        self
    }

    /// Refuse (or accept again) new connections, as an unreachable broker would
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make every publish fail with a transport error
    pub fn fail_publishes(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Publish on the default exchange without a connection.
    ///
    /// Messages to unknown queues are dropped; returns whether the message
    /// was routed.
    pub fn publish(&self, routing_key: &str, envelope: Envelope) -> bool {
        self.inner.published.fetch_add(1, Ordering::SeqCst);

        let delivery = {
            let mut state = self.inner.state();
            let Some(queue) = state.queues.get_mut(routing_key) else {
                self.inner.dropped.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Dropping unroutable message for queue '{}'", routing_key);
                return false;
            };
            match queue.consumer.clone() {
                Some((_, handler)) => Some((handler, queue.delivery(routing_key, envelope))),
                None => {
                    queue.backlog.push_back(envelope);
                    None
                },
            }
        };

        if let Some((handler, delivery)) = delivery {
            handler(delivery);
        }
        true
    }

    /// Connection attempts seen, successful or not
    pub fn connection_attempts(&self) -> u64 {
        self.inner.connection_attempts.load(Ordering::SeqCst)
    }

    /// Connections successfully opened
    pub fn connections_opened(&self) -> u64 {
        self.inner.connections_opened.load(Ordering::SeqCst)
    }

    /// Connections closed
    pub fn connections_closed(&self) -> u64 {
        self.inner.connections_closed.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.inner.state().open_connections.len()
    }

    /// Messages published, routed or not
    pub fn messages_published(&self) -> u64 {
        self.inner.published.load(Ordering::SeqCst)
    }

    /// Messages dropped because no queue matched the routing key
    pub fn messages_dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Whether a queue with this name exists
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state().queues.contains_key(name)
    }

    /// Names of all existing queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a queue currently has a consumer
    pub fn has_consumer(&self, name: &str) -> bool {
        self.inner
            .state()
            .queues
            .get(name)
            .is_some_and(|q| q.consumer.is_some())
    }

    fn open(&self, config: &BrokerConfig) -> Result<MemoryConnection> {
        self.inner.connection_attempts.fetch_add(1, Ordering::SeqCst);

        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(RpcError::Connection(format!(
                "connection refused by {}",
                config.address()
            )));
        }

        let expected = self
            .inner
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some((username, password)) = expected {
            if config.username != username || config.password != password {
                return Err(RpcError::Transport(format!(
                    "ACCESS_REFUSED - login refused for user '{}'",
                    config.username
                )));
            }
        }

        if config.channel_max == 0 {
            return Err(RpcError::Transport(
                "channel limit exhausted (channel_max = 0)".to_string(),
            ));
        }

        let id = {
            let mut state = self.inner.state();
            state.next_connection_id += 1;
            let id = state.next_connection_id;
            state.open_connections.insert(id);
            id
        };
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Memory broker opened connection {}", id);

        Ok(MemoryConnection {
            id,
            broker: self.clone(),
            closed: false,
        })
    }

    fn release(&self, connection: u64) {
        {
            let mut state = self.inner.state();
            state
                .queues
                .retain(|_, queue| queue.owner != Some(connection));
            for queue in state.queues.values_mut() {
                if matches!(queue.consumer, Some((owner, _)) if owner == connection) {
                    queue.consumer = None;
                }
            }
            state.open_connections.remove(&connection);
        }
        self.inner.connections_closed.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Memory broker closed connection {}", connection);
    }
}

impl Broker for MemoryBroker {
    fn connect<'a>(
        &'a self,
        config: &'a BrokerConfig,
    ) -> BrokerFuture<'a, Box<dyn BrokerConnection>> {
        Box::pin(async move {
            let connection = self.open(config)?;
            Ok(Box::new(connection) as Box<dyn BrokerConnection>)
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Connection to a [`MemoryBroker`]
#[derive(Debug)]
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RpcError::Transport(format!(
                "connection {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn declare(&self, name: &str, owner: Option<u64>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.inner.state();
        match state.queues.get(name) {
            Some(queue) if queue.owner.is_some() && queue.owner != Some(self.id) => {
                Err(RpcError::Transport(format!(
                    "RESOURCE_LOCKED - cannot obtain access to exclusive queue '{name}'"
                )))
            },
            Some(_) => Ok(()),
            None => {
                state.queues.insert(name.to_string(), Queue::new(owner));
                Ok(())
            },
        }
    }

    fn attach(&self, name: &str, handler: DeliveryHandler) -> Result<()> {
        self.ensure_open()?;

        let backlog = {
            let mut state = self.broker.inner.state();
            let queue = state.queues.get_mut(name).ok_or_else(|| {
                RpcError::Transport(format!("NOT_FOUND - no queue '{name}'"))
            })?;
            if queue.owner.is_some() && queue.owner != Some(self.id) {
                return Err(RpcError::Transport(format!(
                    "RESOURCE_LOCKED - cannot consume exclusive queue '{name}'"
                )));
            }
            if queue.consumer.is_some() {
                return Err(RpcError::Transport(format!(
                    "ACCESS_REFUSED - queue '{name}' already has a consumer"
                )));
            }
            queue.consumer = Some((self.id, handler.clone()));

            let pending: Vec<Envelope> = queue.backlog.drain(..).collect();
            let mut deliveries = Vec::with_capacity(pending.len());
            for envelope in pending {
                deliveries.push(queue.delivery(name, envelope));
            }
            deliveries
        };

        for delivery in backlog {
            handler(delivery);
        }
        Ok(())
    }
}

impl BrokerConnection for MemoryConnection {
    fn declare_queue<'a>(&'a mut self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.declare(name, None) })
    }

    fn declare_exclusive_queue(&mut self) -> BrokerFuture<'_, String> {
        Box::pin(async move {
            let name = format!("{GENERATED_QUEUE_PREFIX}{}", uuid::Uuid::new_v4().simple());
            self.declare(&name, Some(self.id))?;
            Ok(name)
        })
    }

    fn consume<'a>(
        &'a mut self,
        queue: &'a str,
        handler: DeliveryHandler,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move { self.attach(queue, handler) })
    }

    fn publish<'a>(
        &'a mut self,
        routing_key: &'a str,
        envelope: Envelope,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            if self.broker.inner.fail_publish.load(Ordering::SeqCst) {
                return Err(RpcError::Transport(format!(
                    "publish to '{routing_key}' failed: channel closed by broker"
                )));
            }
            self.broker.publish(routing_key, envelope);
            Ok(())
        })
    }

    fn close(&mut self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.closed {
                self.closed = true;
                self.broker.release(self.id);
            }
            Ok(())
        })
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageProperties;

    fn collector() -> (DeliveryHandler, Arc<Mutex<Vec<Delivery>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: DeliveryHandler = Arc::new(move |d| sink.lock().unwrap().push(d));
        (handler, seen)
    }

    fn text(body: &'static str) -> Envelope {
        Envelope::new(body.as_bytes(), MessageProperties::default())
    }

    #[tokio::test]
    async fn test_publish_to_consumer() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        conn.declare_queue("arca").await.unwrap();

        let (handler, seen) = collector();
        conn.consume("arca", handler).await.unwrap();
        conn.publish("arca", text("one")).await.unwrap();
        conn.publish("arca", text("two")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].delivery_tag, 1);
        assert_eq!(&seen[1].envelope.body[..], b"two");
    }

    #[tokio::test]
    async fn test_backlog_delivered_on_consume() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        conn.declare_queue("arca").await.unwrap();
        conn.publish("arca", text("early")).await.unwrap();

        let (handler, seen) = collector();
        conn.consume("arca", handler).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unroutable_message_dropped() {
        let broker = MemoryBroker::new();
        assert!(!broker.publish("nobody", text("lost")));
        assert_eq!(broker.messages_dropped(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_queue_deleted_on_close() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        let queue = conn.declare_exclusive_queue().await.unwrap();
        assert!(queue.starts_with(GENERATED_QUEUE_PREFIX));
        assert!(broker.has_queue(&queue));

        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(!broker.has_queue(&queue));
        assert_eq!(broker.connections_closed(), 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_queue_private_to_owner() {
        let broker = MemoryBroker::new();
        let mut owner = broker.connect(&BrokerConfig::default()).await.unwrap();
        let mut other = broker.connect(&BrokerConfig::default()).await.unwrap();
        let queue = owner.declare_exclusive_queue().await.unwrap();

        let (handler, _) = collector();
        let err = other.consume(&queue, handler).await.unwrap_err();
        assert!(err.to_string().contains("RESOURCE_LOCKED"));
    }

    #[tokio::test]
    async fn test_consumer_removed_on_close() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        conn.declare_queue("arca").await.unwrap();
        let (handler, _) = collector();
        conn.consume("arca", handler).await.unwrap();
        assert!(broker.has_consumer("arca"));

        conn.close().await.unwrap();
        assert!(broker.has_queue("arca"));
        assert!(!broker.has_consumer("arca"));
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        let err = broker.connect(&BrokerConfig::default()).await.err().unwrap();
        assert!(err.is_connection());
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test]
    async fn test_channel_limit() {
        let broker = MemoryBroker::new();
        let config = BrokerConfig {
            channel_max: 0,
            ..Default::default()
        };
        let err = broker.connect(&config).await.err().unwrap();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_closed_connection_rejects_operations() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connect(&BrokerConfig::default()).await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.declare_queue("arca").await.is_err());
        assert!(conn.publish("arca", text("x")).await.is_err());
    }
}

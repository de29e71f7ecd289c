//! AMQP 0-9-1 broker backend built on `lapin`.
//!
//! Maps [`BrokerConfig`] onto the connection URI: credentials, vhost,
//! heartbeat, channel limit, handshake timeout and the first supported SASL
//! mechanism from `auth_mechanisms`. Each connection opens one channel.
//!
//! Consumers run as tokio tasks that forward every delivery to the
//! registered [`DeliveryHandler`]; they are aborted on [`close`].
//!
//! [`close`]: BrokerConnection::close

use bytes::Bytes;
use futures::StreamExt;
use lapin::auth::SASLMechanism;
use lapin::options::{BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::task::JoinHandle;

use super::{Broker, BrokerConnection, BrokerFuture, DeliveryHandler};
use crate::config::BrokerConfig;
use crate::error::{Result, RpcError};
use crate::protocol::{Delivery, Envelope, MessageProperties};

/// Reply code sent with a normal connection close
const REPLY_SUCCESS: u16 = 200;

/// Broker reached over the network with AMQP 0-9-1.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    /// Create the backend
    pub fn new() -> Self {
        Self
    }
}

impl Broker for AmqpBroker {
    fn connect<'a>(
        &'a self,
        config: &'a BrokerConfig,
    ) -> BrokerFuture<'a, Box<dyn BrokerConnection>> {
        Box::pin(async move {
            let uri = amqp_uri(config);
            let connection = Connection::connect_uri(uri, ConnectionProperties::default())
                .await
                .map_err(|e| connect_error(config, e))?;
            let channel = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    let _ = connection.close(REPLY_SUCCESS, "channel refused").await;
                    return Err(RpcError::Transport(format!("failed to open channel: {e}")));
                },
            };
            tracing::debug!("Connected to {}", config.redacted_uri());

            Ok(Box::new(AmqpConnection {
                connection,
                channel,
                consumers: Vec::new(),
                closed: false,
            }) as Box<dyn BrokerConnection>)
        })
    }

    fn name(&self) -> &'static str {
        "amqp"
    }
}

/// Connection URI for `config`
fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    let mut uri = AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        ..AMQPUri::default()
    };
    uri.query.heartbeat = Some(config.heartbeat_secs);
    uri.query.channel_max = Some(config.channel_max);
    uri.query.connection_timeout = Some(config.connection_timeout_ms);
    uri.query.auth_mechanism = sasl_mechanism(&config.auth_mechanisms);
    uri
}

/// First mechanism in preference order that the client supports
fn sasl_mechanism(preferred: &[String]) -> Option<SASLMechanism> {
    preferred.iter().find_map(|name| {
        let mechanism = match name.to_ascii_uppercase().as_str() {
            "AMQPLAIN" => Some(SASLMechanism::AMQPlain),
            "PLAIN" => Some(SASLMechanism::Plain),
            "EXTERNAL" => Some(SASLMechanism::External),
            "RABBIT-CR-DEMO" => Some(SASLMechanism::RabbitCrDemo),
            _ => None,
        };
        if mechanism.is_none() {
            tracing::warn!("Ignoring unsupported auth mechanism '{}'", name);
        }
        mechanism
    })
}

/// Socket-level failures mean the broker is unreachable; anything after the
/// socket opened (auth, limits, protocol) is a transport failure.
fn connect_error(config: &BrokerConfig, error: lapin::Error) -> RpcError {
    match error {
        lapin::Error::IOError(e) => {
            RpcError::Connection(format!("cannot reach {}: {e}", config.address()))
        },
        other => RpcError::Transport(format!(
            "handshake with {} failed: {other}",
            config.address()
        )),
    }
}

fn transport(action: &str, error: lapin::Error) -> RpcError {
    RpcError::Transport(format!("{action} failed: {error}"))
}

fn properties_of(envelope: &Envelope) -> BasicProperties {
    let props = &envelope.properties;
    let mut properties = BasicProperties::default();
    if let Some(reply_to) = &props.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(correlation_id) = &props.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    if let Some(content_type) = &props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type.as_str()));
    }
    // AMQP timestamps have second resolution
    if props.timestamp > 0 {
        properties = properties.with_timestamp(props.timestamp / 1000);
    }
    properties
}

fn delivery_from(queue: &str, delivery: lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let text = |value: &Option<ShortString>| value.as_ref().map(|s| s.as_str().to_string());
    let properties = MessageProperties {
        reply_to: text(props.reply_to()),
        correlation_id: text(props.correlation_id()),
        content_type: text(props.content_type()),
        timestamp: props.timestamp().map_or(0, |secs| secs.saturating_mul(1000)),
    };

    Delivery {
        queue: queue.to_string(),
        delivery_tag: delivery.delivery_tag,
        envelope: Envelope::new(Bytes::from(delivery.data), properties),
    }
}

/// An open AMQP connection with one channel
pub struct AmqpConnection {
    connection: Connection,
    channel: Channel,
    consumers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl AmqpConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RpcError::Transport("connection is closed".to_string()));
        }
        Ok(())
    }
}

impl BrokerConnection for AmqpConnection {
    fn declare_queue<'a>(&'a mut self, name: &'a str) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            self.channel
                .queue_declare(name, QueueDeclareOptions::default(), FieldTable::default())
                .await
                .map_err(|e| transport("queue declare", e))?;
            Ok(())
        })
    }

    fn declare_exclusive_queue(&mut self) -> BrokerFuture<'_, String> {
        Box::pin(async move {
            self.ensure_open()?;
            let options = QueueDeclareOptions {
                exclusive: true,
                ..QueueDeclareOptions::default()
            };
            let queue = self
                .channel
                .queue_declare("", options, FieldTable::default())
                .await
                .map_err(|e| transport("exclusive queue declare", e))?;
            Ok(queue.name().as_str().to_string())
        })
    }

    fn consume<'a>(
        &'a mut self,
        queue: &'a str,
        handler: DeliveryHandler,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let options = BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            };
            let mut consumer = self
                .channel
                .basic_consume(queue, "", options, FieldTable::default())
                .await
                .map_err(|e| transport("consume", e))?;

            let queue = queue.to_string();
            self.consumers.push(tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => handler(delivery_from(&queue, delivery)),
                        Err(e) => {
                            tracing::warn!("Consumer on '{}' stopped: {}", queue, e);
                            break;
                        },
                    }
                }
            }));
            Ok(())
        })
    }

    fn publish<'a>(
        &'a mut self,
        routing_key: &'a str,
        envelope: Envelope,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let confirm = self
                .channel
                .basic_publish(
                    "",
                    routing_key,
                    BasicPublishOptions::default(),
                    &envelope.body,
                    properties_of(&envelope),
                )
                .await
                .map_err(|e| transport(&format!("publish to '{routing_key}'"), e))?;
            confirm
                .await
                .map_err(|e| transport(&format!("publish to '{routing_key}'"), e))?;
            Ok(())
        })
    }

    fn close(&mut self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;
            for consumer in self.consumers.drain(..) {
                consumer.abort();
            }
            if !self.connection.status().connected() {
                return Ok(());
            }
            self.connection
                .close(REPLY_SUCCESS, "OK")
                .await
                .map_err(|e| transport("close", e))
        })
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

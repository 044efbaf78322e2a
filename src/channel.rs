// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module is the seam between the server and the AMQP client library.
//! `AmqpChannel` exposes the handful of protocol operations the server needs
//! (declare, bind, qos, consume, ack, nack), `Connector` opens a connection
//! and its channel, and the `Lapin*` types implement both on top of `lapin`.

use crate::{
    config::ConnectionOptions, errors::AmqpError, exchange::ExchangeSpec, queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions,
        QueueBindOptions,
    },
    types::{AMQPValue, FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Metadata accompanying a delivered message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// String-valued message headers, used for trace context propagation
    pub headers: BTreeMap<String, String>,
}

/// A message received from a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub body: Vec<u8>,
}

/// Deliveries of one consumer. The stream ends when the broker cancels the
/// consumer or the channel goes away.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// The protocol operations the server performs on its channel.
///
/// Every declaration is idempotent on the broker side, which is what makes
/// replaying setup actions after a reconnect safe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Asserts an exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    /// Asserts a queue and returns its concrete name, which is assigned by
    /// the broker when `name` is empty.
    async fn declare_queue(&self, name: &str, options: &QueueOptions)
        -> Result<String, AmqpError>;

    /// Binds `queue` to `exchange` with `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Limits the number of unacknowledged deliveries per consumer.
    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Starts consuming `queue` with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Handle on the underlying broker connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn close(&self) -> Result<(), AmqpError>;
}

/// An open connection with its channel.
///
/// `closed` yields once the connection or the channel is lost, which is the
/// signal for the connection manager to reconnect.
pub struct Link {
    pub connection: Arc<dyn AmqpConnection>,
    pub channel: Arc<dyn AmqpChannel>,
    pub closed: mpsc::UnboundedReceiver<AmqpError>,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, uri: &str, options: &ConnectionOptions) -> Result<Link, AmqpError>;
}

/// `Connector` backed by `lapin`.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self, uri: &str, options: &ConnectionOptions) -> Result<Link, AmqpError> {
        debug!("creating amqp connection...");
        let mut props = ConnectionProperties::default();
        if let Some(name) = &options.connection_name {
            props = props.with_connection_name(LongString::from(name.clone()));
        }

        let conn = match Connection::connect(uri, props).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (tx, closed) = mpsc::unbounded_channel();
        let conn_tx = tx.clone();
        conn.on_error(move |err| {
            let _ = conn_tx.send(AmqpError::ChannelClosed(err.to_string()));
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        channel.on_error(move |err| {
            let _ = tx.send(AmqpError::ChannelClosed(err.to_string()));
        });
        debug!("channel created");

        Ok(Link {
            connection: Arc::new(LapinConnection { conn }),
            channel: Arc::new(LapinChannel { channel }),
            closed,
        })
    }
}

struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn close(&self) -> Result<(), AmqpError> {
        if !self.conn.status().connected() {
            return Ok(());
        }

        self.conn.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::CloseConnectionError(err.to_string())
        })
    }
}

struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", spec.name);

        self.channel
            .exchange_declare(
                &spec.name,
                lapin::ExchangeKind::from(&spec.kind),
                spec.declare_options(),
                spec.arguments(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = spec.name.as_str(),
                    "error to declare the exchange"
                );
                AmqpError::DeclareExchangeError(spec.name.clone())
            })
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: &QueueOptions,
    ) -> Result<String, AmqpError> {
        debug!("creating queue: {}", name);

        match self
            .channel
            .queue_declare(name, options.declare_options(), options.arguments())
            .await
        {
            Ok(queue) => {
                debug!("queue: {} was created", queue.name().as_str());
                Ok(queue.name().as_str().to_owned())
            }
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, routing_key
        );

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(
                    exchange.to_owned(),
                    queue.to_owned(),
                    routing_key.to_owned(),
                )
            })
    }

    async fn qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(string_headers)
        .unwrap_or_default();

    Delivery {
        envelope: Envelope {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.as_str().to_owned(),
            routing_key: delivery.routing_key.as_str().to_owned(),
            redelivered: delivery.redelivered,
            headers,
        },
        body: delivery.data,
    }
}

fn string_headers(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_lowercase(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::ShortString;

    #[test]
    fn test_string_headers_keeps_text_values() {
        let mut inner = BTreeMap::new();
        inner.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString(LongString::from(
                "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            )),
        );
        inner.insert(
            ShortString::from("X-Source"),
            AMQPValue::ShortString(ShortString::from("catalog")),
        );
        inner.insert(ShortString::from("x-retries"), AMQPValue::LongInt(3));

        let headers = string_headers(&FieldTable::from(inner));

        assert_eq!(headers.len(), 2);
        assert_eq!(
            headers.get("traceparent").map(String::as_str),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        assert_eq!(headers.get("x-source").map(String::as_str), Some("catalog"));
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Options
//!
//! Declaration options a subscriber attaches to its queue. Besides the
//! protocol flags, the common RabbitMQ `x-*` queue arguments (message TTL,
//! length limits, dead-lettering) are typed fields; anything else can be
//! passed through `arguments`.

use crate::arguments::{self, Arguments};
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
};
use serde::Deserialize;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Declaration options of a subscriber queue.
///
/// Defaults to a durable, shared, non auto-deleted queue. Typed fields take
/// precedence over entries with the same name in `arguments`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub passive: bool,
    /// Message TTL in milliseconds
    pub message_ttl: Option<i64>,
    pub max_length: Option<i64>,
    pub max_length_bytes: Option<i64>,
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub arguments: Arguments,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
            message_ttl: None,
            max_length: None,
            max_length_bytes: None,
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
            arguments: Arguments::default(),
        }
    }
}

impl QueueOptions {
    /// Makes the queue transient, it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer is gone.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i64) -> Self {
        self.message_ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i64) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i64) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Routes rejected and expired messages to `exchange`.
    ///
    /// Combined with the `Reject` failure policy this sends failed deliveries
    /// to a dead letter queue instead of dropping them.
    pub fn dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self.dead_letter_routing_key = routing_key.map(str::to_owned);
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = arguments::btree(&self.arguments);

        let longs = [
            (AMQP_HEADERS_MESSAGE_TTL, self.message_ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];
        for (key, value) in longs {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongLongInt(LongLongInt::from(value)),
                );
            }
        }

        let strings = [
            (AMQP_HEADERS_DEAD_LETTER_EXCHANGE, &self.dead_letter_exchange),
            (
                AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
                &self.dead_letter_routing_key,
            ),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value.clone())),
                );
            }
        }

        FieldTable::from(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_options() {
        let opts = QueueOptions::default().declare_options();
        assert!(opts.durable);
        assert!(!opts.exclusive);
        assert!(!opts.auto_delete);
        assert!(QueueOptions::default().arguments().inner().is_empty());
    }

    #[test]
    fn test_typed_arguments() {
        let opts = QueueOptions::default()
            .ttl(30_000)
            .max_length(100)
            .dead_letter("dlx", Some("sync.failed"));

        let args = opts.arguments();
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongLongInt(30_000))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH)),
            Some(&AMQPValue::LongLongInt(100))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE)),
            Some(&AMQPValue::LongString(LongString::from("dlx")))
        );
        assert_eq!(
            inner.get(&ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)),
            Some(&AMQPValue::LongString(LongString::from("sync.failed")))
        );
        assert!(inner
            .get(&ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES))
            .is_none());
    }

    #[test]
    fn test_typed_fields_override_raw_arguments() {
        let opts: QueueOptions = serde_json::from_value(json!({
            "exclusive": true,
            "message_ttl": 1000,
            "arguments": { "x-message-ttl": 5, "x-queue-type": "quorum" },
        }))
        .unwrap();

        assert!(opts.durable);
        assert!(opts.exclusive);

        let args = opts.arguments();
        assert_eq!(
            args.inner().get(&ShortString::from(AMQP_HEADERS_MESSAGE_TTL)),
            Some(&AMQPValue::LongLongInt(1000))
        );
        assert_eq!(
            args.inner().get(&ShortString::from("x-queue-type")),
            Some(&AMQPValue::LongString(LongString::from("quorum")))
        );
    }
}

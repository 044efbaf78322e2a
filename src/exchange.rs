// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! This module defines the exchange part of the topology descriptor. An
//! `ExchangeSpec` is plain data, usually deserialized from configuration,
//! describing one exchange the server asserts on every (re)connection.

use crate::arguments::{self, Arguments};
use lapin::{options::ExchangeDeclareOptions, types::FieldTable};
use serde::Deserialize;
use serde_json::Value;

/// Constant for the argument used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
/// - Custom: Any other exchange type provided by a broker plugin
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
    Custom(String),
}

impl From<&str> for ExchangeKind {
    fn from(kind: &str) -> Self {
        match kind {
            "direct" => ExchangeKind::Direct,
            "fanout" => ExchangeKind::Fanout,
            "topic" => ExchangeKind::Topic,
            "headers" => ExchangeKind::Headers,
            "x-delayed-message" => ExchangeKind::XMessageDelayed,
            other => ExchangeKind::Custom(other.to_owned()),
        }
    }
}

impl From<String> for ExchangeKind {
    fn from(kind: String) -> Self {
        ExchangeKind::from(kind.as_str())
    }
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
            ExchangeKind::Custom(name) => lapin::ExchangeKind::Custom(name.clone()),
        }
    }
}

/// Declaration flags and extra arguments of an exchange.
///
/// Exchanges are durable by default, the same default RabbitMQ client
/// libraries use when asserting an exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub passive: bool,
    pub arguments: Arguments,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        ExchangeOptions {
            durable: true,
            auto_delete: false,
            internal: false,
            passive: false,
            arguments: Arguments::default(),
        }
    }
}

/// Definition of one exchange of the topology.
///
/// Names must be unique within a configuration; the declaration order is
/// irrelevant since all exchanges are asserted concurrently.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    #[serde(alias = "type")]
    pub kind: ExchangeKind,
    #[serde(default)]
    pub options: ExchangeOptions,
}

impl ExchangeSpec {
    /// Creates a new durable direct exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            options: ExchangeOptions::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Creates a delayed exchange routing like `inner` once the delay expires.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn delayed(mut self, inner: ExchangeKind) -> Self {
        let inner = match inner {
            ExchangeKind::Direct => "direct".to_owned(),
            ExchangeKind::Fanout => "fanout".to_owned(),
            ExchangeKind::Topic => "topic".to_owned(),
            ExchangeKind::Headers => "headers".to_owned(),
            ExchangeKind::XMessageDelayed => "x-delayed-message".to_owned(),
            ExchangeKind::Custom(name) => name,
        };
        self.kind = ExchangeKind::XMessageDelayed;
        self.options.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            Value::String(inner),
        );
        self
    }

    /// Adds a single argument to the exchange.
    pub fn argument(mut self, key: &str, value: Value) -> Self {
        self.options.arguments.insert(key.to_owned(), value);
        self
    }

    /// Makes the exchange transient, it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.options.durable = false;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.options.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.options.internal = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.options.passive = true;
        self
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.options.passive,
            durable: self.options.durable,
            auto_delete: self.options.auto_delete,
            internal: self.options.internal,
            nowait: false,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        arguments::field_table(&self.options.arguments)
    }
}

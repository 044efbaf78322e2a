// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Subscriber side of a RabbitMQ integration: a managed connection that
//! reconnects and restores its topology, exchange and queue assertion, and
//! consumer loops dispatching JSON messages to registered handlers.

mod otel;

#[cfg(test)]
mod testing;

pub mod arguments;
pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod queue;
pub mod server;
pub mod subscriber;
pub mod topology;

pub use config::{BrokerConfig, ConnectionOptions, ConsumerOptions, ReconnectPolicy};
pub use connection::{ChannelEvent, ChannelWrapper, ConnectionManager, SetupAction};
pub use consumer::FailurePolicy;
pub use errors::{AmqpError, HandlerError};
pub use exchange::{ExchangeKind, ExchangeSpec};
pub use handler::{handler_fn, DecodedMessage, SubscriberHandler};
pub use queue::QueueOptions;
pub use server::BrokerServer;
pub use subscriber::{
    ComponentRegistry, HandlerRegistry, RoutingKey, SubscribeMetadata, Subscribable,
    SubscriberDescriptor, Subscription,
};

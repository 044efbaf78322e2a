// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Subscriber
//!
//! This module provides the error types used across the crate. `AmqpError`
//! covers connection, channel, topology and acknowledgment failures, while
//! `HandlerError` is what subscriber handlers return to signal that a message
//! could not be processed.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every broker error is logged where it happens and mapped into one of these
/// variants, so callers only ever see typed failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The connection or channel was closed by the broker or the network
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// Error closing the connection
    #[error("failure to close the connection `{0}`")]
    CloseConnectionError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}` with key `{2}`")]
    BindingExchangeToQueueError(String, String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error attaching a consumer to a queue
    #[error("failure to declare consumer on queue `{0}`")]
    ConsumerDeclarationError(String),

    /// Error receiving a message from a consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error loading the broker configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}

/// Error returned by a subscriber handler.
///
/// Returning any of these marks the delivery as failed: it is not acknowledged
/// and the consumer's failure policy decides what the broker is told.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Message(String),

    #[error("failure to decode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Source(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError::Message(msg.into())
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscribers
//!
//! A subscriber ties a handler to a queue bound on an exchange. Components
//! declare their subscriptions through [`Subscribable`]; a [`HandlerRegistry`]
//! flattens them into [`SubscriberDescriptor`]s, and [`bind_subscribers`]
//! registers one setup action per descriptor on the shared channel. Each
//! action asserts the queue, binds it once per routing key and attaches the
//! consumer.

use crate::{
    channel::AmqpChannel,
    config::ConsumerOptions,
    connection::{ChannelWrapper, SetupAction},
    consumer,
    errors::AmqpError,
    handler::SubscriberHandler,
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde::Deserialize;
use std::{fmt, sync::Arc};
use tracing::{debug, error, warn};

/// One routing key or a list of them, as accepted in subscription metadata.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RoutingKey {
    One(String),
    Many(Vec<String>),
}

impl RoutingKey {
    pub fn into_keys(self) -> Vec<String> {
        match self {
            RoutingKey::One(key) => vec![key],
            RoutingKey::Many(keys) => keys,
        }
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        RoutingKey::One(key.to_owned())
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        RoutingKey::One(key)
    }
}

impl From<Vec<String>> for RoutingKey {
    fn from(keys: Vec<String>) -> Self {
        RoutingKey::Many(keys)
    }
}

impl From<Vec<&str>> for RoutingKey {
    fn from(keys: Vec<&str>) -> Self {
        RoutingKey::Many(keys.into_iter().map(str::to_owned).collect())
    }
}

/// What a component declares about one of its handlers.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribeMetadata {
    pub exchange: String,
    pub routing_key: RoutingKey,
    /// Queue to consume, a broker-named queue when absent
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub queue_options: Option<QueueOptions>,
}

impl SubscribeMetadata {
    pub fn new(exchange: &str, routing_key: impl Into<RoutingKey>) -> SubscribeMetadata {
        SubscribeMetadata {
            exchange: exchange.to_owned(),
            routing_key: routing_key.into(),
            queue: None,
            queue_options: None,
        }
    }

    pub fn queue(mut self, name: &str) -> Self {
        self.queue = Some(name.to_owned());
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = Some(options);
        self
    }
}

/// A handler of a component together with its metadata.
pub struct Subscription {
    pub method: String,
    pub metadata: SubscribeMetadata,
    pub handler: Arc<dyn SubscriberHandler>,
}

/// A component exposing zero or more subscriptions.
pub trait Subscribable: Send + Sync {
    fn subscriptions(&self) -> Vec<Subscription>;
}

/// Everything needed to bind and consume one queue.
#[derive(Clone)]
pub struct SubscriberDescriptor {
    pub exchange: String,
    pub routing_keys: Vec<String>,
    /// Empty for a broker-named queue
    pub queue: String,
    pub queue_options: QueueOptions,
    pub handler: Arc<dyn SubscriberHandler>,
}

impl fmt::Debug for SubscriberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberDescriptor")
            .field("exchange", &self.exchange)
            .field("routing_keys", &self.routing_keys)
            .field("queue", &self.queue)
            .field("queue_options", &self.queue_options)
            .finish_non_exhaustive()
    }
}

impl SubscriberDescriptor {
    pub fn new(
        exchange: &str,
        routing_key: impl Into<RoutingKey>,
        handler: Arc<dyn SubscriberHandler>,
    ) -> SubscriberDescriptor {
        SubscriberDescriptor {
            exchange: exchange.to_owned(),
            routing_keys: routing_key.into().into_keys(),
            queue: String::new(),
            queue_options: QueueOptions::default(),
            handler,
        }
    }

    pub fn queue(mut self, name: &str) -> Self {
        self.queue = name.to_owned();
        self
    }

    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Builds a descriptor from subscription metadata.
    ///
    /// Returns `None` when the metadata carries no routing key.
    pub fn from_metadata(
        metadata: SubscribeMetadata,
        handler: Arc<dyn SubscriberHandler>,
    ) -> Option<SubscriberDescriptor> {
        let routing_keys = metadata.routing_key.into_keys();
        if routing_keys.is_empty() {
            return None;
        }

        Some(SubscriberDescriptor {
            exchange: metadata.exchange,
            routing_keys,
            queue: metadata.queue.unwrap_or_default(),
            queue_options: metadata.queue_options.unwrap_or_default(),
            handler,
        })
    }
}

/// Source of the subscriber descriptors the server binds on start.
pub trait HandlerRegistry: Send + Sync {
    fn list_subscriber_descriptors(&self) -> Vec<SubscriberDescriptor>;
}

impl HandlerRegistry for Vec<SubscriberDescriptor> {
    fn list_subscriber_descriptors(&self) -> Vec<SubscriberDescriptor> {
        self.clone()
    }
}

/// Registry of subscribable components.
#[derive(Default)]
pub struct ComponentRegistry {
    components: Vec<Arc<dyn Subscribable>>,
}

impl ComponentRegistry {
    pub fn new() -> ComponentRegistry {
        ComponentRegistry::default()
    }

    pub fn register(mut self, component: Arc<dyn Subscribable>) -> Self {
        self.components.push(component);
        self
    }
}

impl HandlerRegistry for ComponentRegistry {
    fn list_subscriber_descriptors(&self) -> Vec<SubscriberDescriptor> {
        self.components
            .iter()
            .flat_map(|component| component.subscriptions())
            .filter_map(|sub| {
                let method = sub.method;
                let descriptor = SubscriberDescriptor::from_metadata(sub.metadata, sub.handler);
                if descriptor.is_none() {
                    warn!(method, "subscription without routing key, skipping");
                }
                descriptor
            })
            .collect()
    }
}

/// Setup action binding one subscriber: queue, bindings, then consumer.
pub struct SubscriberSetup {
    descriptor: SubscriberDescriptor,
    options: ConsumerOptions,
}

impl SubscriberSetup {
    pub fn new(descriptor: SubscriberDescriptor, options: ConsumerOptions) -> SubscriberSetup {
        SubscriberSetup {
            descriptor,
            options,
        }
    }
}

#[async_trait]
impl SetupAction for SubscriberSetup {
    fn label(&self) -> String {
        let queue = match self.descriptor.queue.as_str() {
            "" => "<server-named>",
            name => name,
        };
        format!(
            "subscriber {} <- {} [{}]",
            queue,
            self.descriptor.exchange,
            self.descriptor.routing_keys.join(", ")
        )
    }

    async fn apply(&self, channel: Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        let descriptor = &self.descriptor;

        // the concrete name is resolved once and used for binding and consuming
        let queue = channel
            .declare_queue(&descriptor.queue, &descriptor.queue_options)
            .await?;

        try_join_all(
            descriptor
                .routing_keys
                .iter()
                .map(|key| channel.bind_queue(&queue, &descriptor.exchange, key)),
        )
        .await?;
        debug!(
            "queue: {} bound to exchange: {} with {} keys",
            queue,
            descriptor.exchange,
            descriptor.routing_keys.len()
        );

        consumer::consume(
            channel.clone(),
            &queue,
            descriptor.handler.clone(),
            self.options.clone(),
        )
        .await?;

        Ok(())
    }
}

/// Registers one setup action per descriptor on `channel`.
///
/// A descriptor failing to set up does not prevent the others from being
/// registered; its failure is reported through the channel events and the
/// action is retried on the next reconnection.
pub async fn bind_subscribers(
    channel: &ChannelWrapper,
    descriptors: Vec<SubscriberDescriptor>,
    options: &ConsumerOptions,
) {
    for descriptor in descriptors {
        if descriptor.routing_keys.is_empty() {
            warn!(
                queue = descriptor.queue.as_str(),
                exchange = descriptor.exchange.as_str(),
                "subscriber without routing key, skipping"
            );
            continue;
        }

        let setup = SubscriberSetup::new(descriptor, options.clone());
        let label = setup.label();

        if let Err(err) = channel.add_setup(Arc::new(setup)).await {
            error!(error = err.to_string(), subscriber = label, "failure to bind subscriber");
        }
    }
}

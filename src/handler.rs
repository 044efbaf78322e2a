// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscriber Handlers
//!
//! A handler receives every message delivered to the queue it was bound to,
//! already decoded as JSON when possible. Returning `Ok` acknowledges the
//! message; returning an error leaves it unacknowledged and hands it to the
//! consumer's failure policy.

use crate::{
    channel::{AmqpChannel, Delivery, Envelope},
    errors::HandlerError,
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{fmt, future::Future, sync::Arc};

/// A message as handed to a subscriber handler.
#[derive(Clone)]
pub struct DecodedMessage {
    /// The body parsed as JSON, `None` when the body is empty or not JSON
    pub data: Option<Value>,
    pub body: Vec<u8>,
    pub envelope: Envelope,
    pub channel: Arc<dyn AmqpChannel>,
    /// Trace context extracted from the message headers
    pub context: Context,
}

impl DecodedMessage {
    pub(crate) fn decode(delivery: Delivery, channel: Arc<dyn AmqpChannel>, context: Context) -> Self {
        let data = decode_body(&delivery.body);

        DecodedMessage {
            data,
            body: delivery.body,
            envelope: delivery.envelope,
            channel,
            context,
        }
    }

    /// Deserializes the parsed payload into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        match &self.data {
            Some(value) => Ok(T::deserialize(value)?),
            None => Err(HandlerError::new("message body is not valid json")),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.envelope.routing_key
    }
}

impl fmt::Debug for DecodedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedMessage")
            .field("data", &self.data)
            .field("body_len", &self.body.len())
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

fn decode_body(body: &[u8]) -> Option<Value> {
    if body.is_empty() {
        return None;
    }

    serde_json::from_slice(body).ok()
}

/// Processes the messages of one subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscriberHandler: Send + Sync {
    async fn handle(&self, msg: &DecodedMessage) -> Result<(), HandlerError>;
}

/// Adapts an async closure into a [`SubscriberHandler`].
pub struct ClosureHandler<F> {
    f: F,
}

impl<F> ClosureHandler<F> {
    pub fn new(f: F) -> Self {
        ClosureHandler { f }
    }
}

#[async_trait]
impl<F, Fut> SubscriberHandler for ClosureHandler<F>
where
    F: Fn(DecodedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, msg: &DecodedMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Shorthand for `Arc::new(ClosureHandler::new(f))`.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn SubscriberHandler>
where
    F: Fn(DecodedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(ClosureHandler::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockAmqpChannel;
    use serde::Deserialize;
    use serde_json::json;

    fn message(body: &[u8]) -> DecodedMessage {
        let delivery = Delivery {
            envelope: Envelope {
                delivery_tag: 1,
                routing_key: "model.category.created".to_owned(),
                ..Envelope::default()
            },
            body: body.to_vec(),
        };

        DecodedMessage::decode(delivery, Arc::new(MockAmqpChannel::new()), Context::new())
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Category {
        id: String,
        name: String,
    }

    #[test]
    fn test_decode_json_body() {
        let msg = message(br#"{"id":"1","name":"x"}"#);

        assert_eq!(msg.data, Some(json!({"id": "1", "name": "x"})));
        assert_eq!(msg.routing_key(), "model.category.created");
        assert_eq!(
            msg.payload::<Category>().unwrap(),
            Category {
                id: "1".to_owned(),
                name: "x".to_owned()
            }
        );
    }

    #[test]
    fn test_decode_invalid_json_keeps_raw_body() {
        let msg = message(b"not json");

        assert_eq!(msg.data, None);
        assert_eq!(msg.body, b"not json".to_vec());
        assert!(msg.payload::<Category>().is_err());
    }

    #[test]
    fn test_decode_empty_body() {
        let msg = message(b"");

        assert_eq!(msg.data, None);
        assert!(msg.body.is_empty());
    }

    #[test]
    fn test_payload_missing_field() {
        let msg = message(br#"{"name":"x"}"#);

        assert!(matches!(
            msg.payload::<Category>(),
            Err(HandlerError::Payload(_))
        ));
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = handler_fn(|msg: DecodedMessage| async move {
            match msg.data {
                Some(_) => Ok(()),
                None => Err(HandlerError::new("no data")),
            }
        });

        assert!(handler.handle(&message(b"{}")).await.is_ok());
        assert!(handler.handle(&message(b"oops")).await.is_err());
    }
}

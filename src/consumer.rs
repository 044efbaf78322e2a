// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module provides the consumer loop attached to every subscriber queue.
//! Each delivery is processed in its own task:
//! 1. A consumer span is opened with the trace context found in the headers
//! 2. The body is decoded as JSON (an invalid body yields no data, not an error)
//! 3. The subscriber handler is invoked
//! 4. The delivery is acknowledged on success
//! 5. On failure, a panicking handler included, the error is reported and
//!    the [`FailurePolicy`] applies
//!
//! Nothing that happens while processing a delivery can stop the loop.

use crate::{
    channel::{AmqpChannel, Delivery},
    config::ConsumerOptions,
    errors::{AmqpError, HandlerError},
    handler::{DecodedMessage, SubscriberHandler},
    otel,
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::trace::{Span, Status};
use serde::Deserialize;
use std::{any::Any, borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// What the consumer tells the broker about a delivery whose handler failed.
///
/// None of the policies acknowledge the delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// `basic.nack` with requeue, the broker redelivers the message
    #[default]
    Requeue,
    /// `basic.nack` without requeue, the message is dead-lettered when the
    /// queue has a dead letter exchange and dropped otherwise
    Reject,
    /// Nothing is sent, the message stays unacknowledged until the channel
    /// closes and the broker redelivers it
    LeaveUnacked,
}

/// Final state of a processed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked,
    Skipped,
    Requeued,
    Rejected,
    LeftUnacked,
}

/// Attaches a consumer to `queue` and spawns the loop dispatching its
/// deliveries to `handler`.
///
/// Returns once the consumer is registered on the broker. The returned task
/// finishes when the delivery stream ends, after the in-flight deliveries
/// are done.
pub async fn consume(
    channel: Arc<dyn AmqpChannel>,
    queue: &str,
    handler: Arc<dyn SubscriberHandler>,
    options: ConsumerOptions,
) -> Result<JoinHandle<()>, AmqpError> {
    // queue names may use the whole shortstr length, the tag must not
    let consumer_tag = Uuid::new_v4().to_string();
    let mut deliveries = channel.consume(queue, &consumer_tag).await?;
    debug!(queue, consumer_tag = consumer_tag.as_str(), "consumer attached");

    let queue = queue.to_owned();

    Ok(tokio::spawn(async move {
        let mut inflight = JoinSet::new();

        while let Some(result) = deliveries.next().await {
            match result {
                Ok(delivery) => {
                    let channel = channel.clone();
                    let handler = handler.clone();
                    let options = options.clone();
                    let queue = queue.clone();

                    inflight.spawn(async move {
                        let tag = delivery.envelope.delivery_tag;
                        match process_delivery(channel, &queue, &handler, &options, delivery).await
                        {
                            Ok(outcome) => debug!(
                                queue = queue.as_str(),
                                delivery_tag = tag,
                                ?outcome,
                                "message processed"
                            ),
                            Err(err) => error!(
                                error = err.to_string(),
                                queue = queue.as_str(),
                                delivery_tag = tag,
                                "error consume msg"
                            ),
                        }
                    });
                }
                Err(err) => error!(
                    error = err.to_string(),
                    queue = queue.as_str(),
                    "errors consume msg"
                ),
            }

            while let Some(joined) = inflight.try_join_next() {
                report_join(joined, &queue);
            }
        }

        warn!(
            queue = queue.as_str(),
            consumer_tag = consumer_tag.as_str(),
            "consumer cancelled, unacked messages will be redelivered by the broker"
        );

        while let Some(joined) = inflight.join_next().await {
            report_join(joined, &queue);
        }
    }))
}

fn report_join(joined: Result<(), tokio::task::JoinError>, queue: &str) {
    if let Err(err) = joined {
        error!(error = err.to_string(), queue, "message processing task failed");
    }
}

/// Processes one delivery end to end.
///
/// Only ack/nack failures are returned as errors, handler failures are
/// contained here and turned into an [`Outcome`].
pub(crate) async fn process_delivery(
    channel: Arc<dyn AmqpChannel>,
    queue: &str,
    handler: &Arc<dyn SubscriberHandler>,
    options: &ConsumerOptions,
    delivery: Delivery,
) -> Result<Outcome, AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.envelope, queue);
    let tag = delivery.envelope.delivery_tag;

    debug!(
        "received: {} - exchange: {}",
        delivery.envelope.routing_key, delivery.envelope.exchange,
    );

    if delivery.body.is_empty() && options.skip_empty_body {
        warn!(queue, delivery_tag = tag, "skipping message with empty body");
        return Ok(Outcome::Skipped);
    }

    let msg = DecodedMessage::decode(delivery, channel.clone(), ctx);
    if msg.data.is_none() && !msg.body.is_empty() {
        debug!(queue, delivery_tag = tag, "payload is not json, handing raw body over");
    }

    let handled = AssertUnwindSafe(async { handler.handle(&msg).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panicked(panic)));

    match handled {
        Ok(()) => match channel.ack(tag).await {
            Ok(()) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
                Ok(Outcome::Acked)
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("error to ack msg"),
                });
                Err(err)
            }
        },
        Err(err) => {
            error!(
                error = err.to_string(),
                queue,
                routing_key = msg.routing_key(),
                delivery_tag = tag,
                "error whiling handling msg"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("handler failure"),
            });

            apply_failure_policy(&channel, tag, options.failure_policy).await
        }
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> HandlerError {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|reason| reason.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_owned());

    HandlerError::new(format!("handler panicked: {}", reason))
}

async fn apply_failure_policy(
    channel: &Arc<dyn AmqpChannel>,
    tag: u64,
    policy: FailurePolicy,
) -> Result<Outcome, AmqpError> {
    match policy {
        FailurePolicy::Requeue => {
            warn!(delivery_tag = tag, "requeuing msg for latter");
            channel.nack(tag, true).await.map(|_| Outcome::Requeued)
        }
        FailurePolicy::Reject => {
            warn!(delivery_tag = tag, "rejecting msg");
            channel.nack(tag, false).await.map(|_| Outcome::Rejected)
        }
        FailurePolicy::LeaveUnacked => Ok(Outcome::LeftUnacked),
    }
}

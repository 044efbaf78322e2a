// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the tests: records declarations, routes published
//! messages through topic/direct/fanout bindings and can simulate lost
//! connections.

use crate::{
    channel::{
        AmqpChannel, AmqpConnection, Connector, Delivery, DeliveryStream, Envelope, Link,
    },
    config::ConnectionOptions,
    errors::AmqpError,
    exchange::{ExchangeKind, ExchangeSpec},
    queue::QueueOptions,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::sync::mpsc;

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Default)]
struct BrokerState {
    exchanges: BTreeMap<String, ExchangeKind>,
    queues: BTreeSet<String>,
    // (exchange, routing key, queue)
    bindings: BTreeSet<(String, String, String)>,
    consumers: Vec<(String, DeliverySender)>,
    links: Vec<mpsc::UnboundedSender<AmqpError>>,
    acked: Vec<u64>,
    nacked: Vec<(u64, bool)>,
    exchange_declares: usize,
    queue_declares: usize,
    binds: usize,
    consumes: usize,
    next_tag: u64,
    generated_queues: usize,
    connects: usize,
    fail_connects: usize,
    closed_connections: usize,
}

#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> FakeBroker {
        let broker = FakeBroker::default();
        {
            let mut state = broker.lock();
            state
                .exchanges
                .insert("amq.direct".to_owned(), ExchangeKind::Direct);
            state
                .exchanges
                .insert("amq.fanout".to_owned(), ExchangeKind::Fanout);
            state
                .exchanges
                .insert("amq.topic".to_owned(), ExchangeKind::Topic);
        }
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn fail_next_connects(&self, count: usize) {
        self.lock().fail_connects = count;
    }

    pub(crate) fn connects(&self) -> usize {
        self.lock().connects
    }

    pub(crate) fn closed_connections(&self) -> usize {
        self.lock().closed_connections
    }

    /// Simulates the network dropping every open connection.
    pub(crate) fn drop_connections(&self, reason: &str) {
        let mut state = self.lock();
        for link in state.links.drain(..) {
            let _ = link.send(AmqpError::ChannelClosed(reason.to_owned()));
        }
        state.consumers.clear();
    }

    /// Publishes `body` and returns the number of consumers it was delivered to.
    pub(crate) fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> usize {
        let mut state = self.lock();
        let Some(kind) = state.exchanges.get(exchange).cloned() else {
            return 0;
        };

        let queues: BTreeSet<String> = state
            .bindings
            .iter()
            .filter(|(ex, key, _)| {
                ex == exchange
                    && match kind {
                        ExchangeKind::Fanout => true,
                        ExchangeKind::Topic => topic_matches(key, routing_key),
                        _ => key == routing_key,
                    }
            })
            .map(|(_, _, queue)| queue.clone())
            .collect();

        let mut delivered = 0;
        for queue in queues {
            state.consumers.retain(|(_, tx)| !tx.is_closed());
            let Some(tx) = state
                .consumers
                .iter()
                .find(|(q, _)| *q == queue)
                .map(|(_, tx)| tx.clone())
            else {
                continue;
            };

            state.next_tag += 1;
            let delivery = Delivery {
                envelope: Envelope {
                    delivery_tag: state.next_tag,
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    redelivered: false,
                    headers: BTreeMap::new(),
                },
                body: body.to_vec(),
            };
            if tx.send(Ok(delivery)).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    pub(crate) fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    pub(crate) fn nacked(&self) -> Vec<(u64, bool)> {
        self.lock().nacked.clone()
    }

    pub(crate) fn exchanges(&self) -> Vec<String> {
        self.lock().exchanges.keys().cloned().collect()
    }

    pub(crate) fn queues(&self) -> Vec<String> {
        self.lock().queues.iter().cloned().collect()
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String, String)> {
        self.lock().bindings.iter().cloned().collect()
    }

    pub(crate) fn active_consumers(&self) -> usize {
        let mut state = self.lock();
        state.consumers.retain(|(_, tx)| !tx.is_closed());
        state.consumers.len()
    }

    pub(crate) fn exchange_declares(&self) -> usize {
        self.lock().exchange_declares
    }

    pub(crate) fn queue_declares(&self) -> usize {
        self.lock().queue_declares
    }

    pub(crate) fn binds(&self) -> usize {
        self.lock().binds
    }

    pub(crate) fn consumes(&self) -> usize {
        self.lock().consumes
    }
}

#[async_trait]
impl Connector for FakeBroker {
    async fn connect(&self, _uri: &str, _options: &ConnectionOptions) -> Result<Link, AmqpError> {
        let mut state = self.lock();
        state.connects += 1;
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let (tx, closed) = mpsc::unbounded_channel();
        state.links.push(tx);

        Ok(Link {
            connection: Arc::new(FakeConnection {
                broker: self.clone(),
            }),
            channel: Arc::new(FakeChannel {
                broker: self.clone(),
            }),
            closed,
        })
    }
}

struct FakeConnection {
    broker: FakeBroker,
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.closed_connections += 1;
        state.consumers.clear();
        state.links.clear();
        Ok(())
    }
}

struct FakeChannel {
    broker: FakeBroker,
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.exchange_declares += 1;

        match state.exchanges.get(&spec.name) {
            Some(kind) if *kind != spec.kind => {
                Err(AmqpError::DeclareExchangeError(spec.name.clone()))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.kind.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: &QueueOptions,
    ) -> Result<String, AmqpError> {
        let mut state = self.broker.lock();
        state.queue_declares += 1;

        let name = if name.is_empty() {
            state.generated_queues += 1;
            format!("amq.gen-{}", state.generated_queues)
        } else {
            name.to_owned()
        };
        state.queues.insert(name.clone());

        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.binds += 1;

        if !state.exchanges.contains_key(exchange) || !state.queues.contains(queue) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
                routing_key.to_owned(),
            ));
        }

        state.bindings.insert((
            exchange.to_owned(),
            routing_key.to_owned(),
            queue.to_owned(),
        ));
        Ok(())
    }

    async fn qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.broker.lock();
        state.consumes += 1;

        if !state.queues.contains(queue) {
            return Err(AmqpError::ConsumerDeclarationError(queue.to_owned()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.consumers.push((queue.to_owned(), tx));

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.broker.lock().acked.push(delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.broker.lock().nacked.push((delivery_tag, requeue));
        Ok(())
    }
}

fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(word), Some(part)) if word == part => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Polls `condition` until it holds, failing the test after a few seconds.
pub(crate) async fn wait_for<F: Fn() -> bool>(condition: F) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "condition not met in time");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches("model.category.*", "model.category.created"));
        assert!(!topic_matches("model.category.*", "model.genre.created"));
        assert!(!topic_matches("model.category.*", "model.category"));
        assert!(topic_matches("model.#", "model.category.created"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(topic_matches("model.*.deleted", "model.video.deleted"));
    }
}

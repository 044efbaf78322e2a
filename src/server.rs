// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Broker Server
//!
//! Lifecycle owner of the broker integration. On start it registers the
//! exchange assertion and one subscriber per descriptor on the shared
//! channel, then opens the managed connection, and tracks whether the channel
//! is currently usable through [`BrokerServer::listening`].

use crate::{
    channel::{Connector, LapinConnector},
    config::BrokerConfig,
    connection::{ChannelEvent, ChannelWrapper, ConnectionManager},
    errors::AmqpError,
    subscriber::{bind_subscribers, HandlerRegistry},
    topology::setup_exchanges,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

struct Running {
    manager: ConnectionManager,
    channel: Arc<ChannelWrapper>,
}

/// Broker server binding the registered subscribers to RabbitMQ.
pub struct BrokerServer {
    config: BrokerConfig,
    registry: Arc<dyn HandlerRegistry>,
    connector: Arc<dyn Connector>,
    listening: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
}

impl BrokerServer {
    /// Creates a server connecting through lapin.
    ///
    /// # Parameters
    /// * `config` - Broker URI, connection options and exchanges to assert
    /// * `registry` - Source of the subscriber descriptors bound on start
    pub fn new(config: BrokerConfig, registry: Arc<dyn HandlerRegistry>) -> BrokerServer {
        BrokerServer::with_connector(config, registry, Arc::new(LapinConnector))
    }

    /// Creates a server opening its connections through `connector`.
    pub fn with_connector(
        config: BrokerConfig,
        registry: Arc<dyn HandlerRegistry>,
        connector: Arc<dyn Connector>,
    ) -> BrokerServer {
        BrokerServer {
            config,
            registry,
            connector,
            listening: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Whether the channel is connected with its whole topology in place.
    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// The shared channel, once started.
    pub async fn channel(&self) -> Option<Arc<ChannelWrapper>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.channel.clone())
    }

    /// Starts the server.
    ///
    /// The listener and every setup action are registered before the
    /// connection is started, so the first `Connect` already has the whole
    /// topology behind it. Returns without waiting for the broker: connection
    /// failures are retried in the background and reported through the logs
    /// and the channel events. Calling it on a started server does nothing.
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError when a setup action could not be
    /// registered
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("broker server already started");
            return Ok(());
        }

        let manager = ConnectionManager::new(
            &self.config.uri,
            self.config.connection.clone(),
            self.connector.clone(),
        );
        let channel = manager.create_channel();

        let listening = self.listening.clone();
        channel.on(move |event| match event {
            ChannelEvent::Connect => {
                listening.store(true, Ordering::SeqCst);
                info!("successfully connected a rabbitmq channel");
            }
            ChannelEvent::Error { name, error } => {
                listening.store(false, Ordering::SeqCst);
                error!(
                    error = error.to_string(),
                    channel = name.as_str(),
                    "rabbitmq channel error"
                );
            }
        });

        let result = setup_exchanges(&channel, &self.config).await;
        if let Err(err) = &result {
            error!(error = err.to_string(), "failure to setup exchanges");
        }

        bind_subscribers(
            &channel,
            self.registry.list_subscriber_descriptors(),
            &self.config.consumer,
        )
        .await;

        manager.start().await;
        *running = Some(Running { manager, channel });

        result
    }

    /// Stops reconnecting and closes the connection.
    ///
    /// In-flight deliveries are not acknowledged anymore and will be
    /// redelivered by the broker.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        let result = running.manager.close().await;
        self.listening.store(false, Ordering::SeqCst);
        debug!(channel = running.channel.name(), "broker server stopped");

        result
    }
}

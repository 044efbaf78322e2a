// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Management
//!
//! `ConnectionManager` keeps a broker connection alive: it connects in the
//! background, retries with an exponential backoff while the broker is
//! unreachable and reconnects whenever the connection or its channel is lost.
//!
//! `ChannelWrapper` is the channel handle shared by everything that declares
//! topology. Setup actions registered on it are kept in registration order
//! and replayed in full on every new channel, so the topology and the
//! consumers come back after a reconnect without any caller involvement.

use crate::{
    channel::{AmqpChannel, Connector, Link},
    config::ConnectionOptions,
    errors::AmqpError,
};
use async_trait::async_trait;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

/// Channel name used in events when the connection has no name.
pub const DEFAULT_CHANNEL_NAME: &str = "default";

const EVENTS_CAPACITY: usize = 64;

/// An idempotent declaration performed on every new channel.
#[async_trait]
pub trait SetupAction: Send + Sync {
    /// Human readable description, used in logs and for introspection.
    fn label(&self) -> String;

    async fn apply(&self, channel: Arc<dyn AmqpChannel>) -> Result<(), AmqpError>;
}

/// State changes of the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is usable and every setup action succeeded.
    Connect,
    /// Connecting, setting up or using the channel failed.
    Error { name: String, error: AmqpError },
}

type Listener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

struct SetupState {
    actions: Vec<Arc<dyn SetupAction>>,
    live: Option<Arc<dyn AmqpChannel>>,
}

/// Channel handle replaying its setup actions after every reconnect.
pub struct ChannelWrapper {
    name: String,
    setup: Mutex<SetupState>,
    listeners: RwLock<Vec<Listener>>,
    events: broadcast::Sender<ChannelEvent>,
    connected: AtomicBool,
}

impl fmt::Debug for ChannelWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWrapper")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl ChannelWrapper {
    pub(crate) fn new(name: &str) -> ChannelWrapper {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        ChannelWrapper {
            name: name.to_owned(),
            setup: Mutex::new(SetupState {
                actions: vec![],
                live: None,
            }),
            listeners: RwLock::new(vec![]),
            events,
            connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the last channel event was `Connect`.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Registers a setup action.
    ///
    /// When a channel is currently open the action runs right away and its
    /// result is returned; otherwise it runs on the next connection. Either
    /// way it is replayed on every later reconnection.
    pub async fn add_setup(&self, action: Arc<dyn SetupAction>) -> Result<(), AmqpError> {
        let mut state = self.setup.lock().await;
        debug!(channel = self.name.as_str(), action = action.label(), "registering setup action");
        state.actions.push(action.clone());

        let Some(channel) = state.live.clone() else {
            return Ok(());
        };

        action.apply(channel).await.inspect_err(|err| {
            error!(
                error = err.to_string(),
                action = action.label(),
                "failure to run setup action"
            );
            self.emit(ChannelEvent::Error {
                name: self.name.clone(),
                error: err.clone(),
            });
        })
    }

    /// Labels of the registered setup actions, in registration order.
    pub async fn setup_actions(&self) -> Vec<String> {
        self.setup
            .lock()
            .await
            .actions
            .iter()
            .map(|action| action.label())
            .collect()
    }

    /// Registers a listener called synchronously on every channel event.
    ///
    /// A listener registered while the channel is connected is immediately
    /// told so. Listeners must not register other listeners.
    pub fn on<F>(&self, listener: F)
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);

        let Ok(mut listeners) = self.listeners.write() else {
            error!("channel listeners lock poisoned");
            return;
        };

        // checked under the lock `emit` updates the state with, so a
        // concurrent `Connect` is either seen here or delivered to this listener
        if self.is_connected() {
            listener(&ChannelEvent::Connect);
        }
        listeners.push(listener);
    }

    /// Subscribes to the channel events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Makes `channel` the live channel and replays every setup action on it.
    ///
    /// Emits `Connect` when everything succeeded, one `Error` per failure
    /// otherwise.
    pub(crate) async fn establish(
        &self,
        channel: Arc<dyn AmqpChannel>,
        prefetch_count: Option<u16>,
    ) -> bool {
        let mut state = self.setup.lock().await;
        state.live = Some(channel.clone());

        let mut healthy = true;

        if let Some(count) = prefetch_count {
            if let Err(err) = channel.qos(count).await {
                self.emit(ChannelEvent::Error {
                    name: self.name.clone(),
                    error: err,
                });
                healthy = false;
            }
        }

        for action in state.actions.iter() {
            debug!(channel = self.name.as_str(), action = action.label(), "running setup action");
            if let Err(err) = action.apply(channel.clone()).await {
                error!(
                    error = err.to_string(),
                    action = action.label(),
                    "failure to run setup action"
                );
                self.emit(ChannelEvent::Error {
                    name: self.name.clone(),
                    error: err,
                });
                healthy = false;
            }
        }

        if healthy {
            self.emit(ChannelEvent::Connect);
        }

        healthy
    }

    /// Forgets the live channel, reporting `error` when there is one.
    pub(crate) async fn invalidate(&self, error: Option<AmqpError>) {
        self.setup.lock().await.live = None;

        match error {
            Some(error) => self.emit(ChannelEvent::Error {
                name: self.name.clone(),
                error,
            }),
            None => {
                self.set_connected(false);
            }
        }
    }

    /// Updates the connection state and returns the listeners to notify of
    /// the change.
    fn set_connected(&self, connected: bool) -> Vec<Listener> {
        match self.listeners.write() {
            Ok(listeners) => {
                self.connected.store(connected, Ordering::SeqCst);
                listeners.clone()
            }
            Err(_) => {
                self.connected.store(connected, Ordering::SeqCst);
                error!("channel listeners lock poisoned");
                vec![]
            }
        }
    }

    fn emit(&self, event: ChannelEvent) {
        let listeners = self.set_connected(event == ChannelEvent::Connect);
        for listener in listeners {
            listener(&event);
        }

        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Owner of the broker connection and of the shared channel.
pub struct ConnectionManager {
    channel: Arc<ChannelWrapper>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<SupervisorState>,
}

enum SupervisorState {
    Idle(Supervisor),
    Running(JoinHandle<Result<(), AmqpError>>),
    Closed,
}

impl ConnectionManager {
    /// Prepares a connection to `uri` without connecting yet.
    ///
    /// Setup actions and listeners registered on [`create_channel`] before
    /// [`start`] are all in place when the first connection is established.
    ///
    /// [`create_channel`]: ConnectionManager::create_channel
    /// [`start`]: ConnectionManager::start
    pub fn new(
        uri: &str,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> ConnectionManager {
        let name = options
            .connection_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CHANNEL_NAME.to_owned());
        let channel = Arc::new(ChannelWrapper::new(&name));
        let (shutdown, signal) = watch::channel(false);

        let supervisor = Supervisor {
            uri: uri.to_owned(),
            options,
            connector,
            channel: channel.clone(),
            shutdown: signal,
        };

        ConnectionManager {
            channel,
            shutdown,
            supervisor: Mutex::new(SupervisorState::Idle(supervisor)),
        }
    }

    /// Starts connecting to `uri` in the background.
    ///
    /// Never fails: an unreachable broker is retried on the backoff policy of
    /// `options` and reported through `Error` channel events.
    pub async fn connect(
        uri: &str,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> ConnectionManager {
        let manager = ConnectionManager::new(uri, options, connector);
        manager.start().await;
        manager
    }

    /// Spawns the task connecting and reconnecting to the broker.
    ///
    /// Does nothing when already started or closed.
    pub async fn start(&self) {
        let mut state = self.supervisor.lock().await;
        if !matches!(*state, SupervisorState::Idle(_)) {
            return;
        }

        if let SupervisorState::Idle(supervisor) =
            std::mem::replace(&mut *state, SupervisorState::Closed)
        {
            *state = SupervisorState::Running(tokio::spawn(supervisor.run()));
        }
    }

    /// Returns the channel shared by every user of this connection.
    pub fn create_channel(&self) -> Arc<ChannelWrapper> {
        self.channel.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Stops reconnecting and closes the connection.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let _ = self.shutdown.send(true);

        let state = std::mem::replace(
            &mut *self.supervisor.lock().await,
            SupervisorState::Closed,
        );
        let SupervisorState::Running(supervisor) = state else {
            return Ok(());
        };

        match supervisor.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "connection supervisor failed");
                Err(AmqpError::InternalError)
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

struct Supervisor {
    uri: String,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    channel: Arc<ChannelWrapper>,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) -> Result<(), AmqpError> {
        let mut attempt: u32 = 0;

        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }

            debug!(channel = self.channel.name(), "connecting to the broker...");
            let connected = tokio::select! {
                result = self.connector.connect(&self.uri, &self.options) => result,
                _ = self.shutdown.changed() => return Ok(()),
            };

            let mut link: Link = match connected {
                Ok(link) => link,
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "failure to connect, retrying");
                    self.channel.invalidate(Some(err)).await;
                    if !self.backoff(attempt).await {
                        return Ok(());
                    }
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            if self
                .channel
                .establish(link.channel.clone(), self.options.prefetch_count)
                .await
            {
                attempt = 0;
            }

            tokio::select! {
                closed = link.closed.recv() => {
                    let error = closed.unwrap_or_else(|| {
                        AmqpError::ChannelClosed("connection dropped".to_owned())
                    });
                    warn!(error = error.to_string(), "connection lost, reconnecting");
                    self.channel.invalidate(Some(error)).await;

                    if let Err(err) = link.connection.close().await {
                        debug!(error = err.to_string(), "closing a lost connection");
                    }

                    if !self.backoff(attempt).await {
                        return Ok(());
                    }
                    attempt = attempt.saturating_add(1);
                }
                _ = self.shutdown.changed() => {
                    debug!(channel = self.channel.name(), "closing the connection...");
                    self.channel.invalidate(None).await;
                    return link.connection.close().await;
                }
            }
        }
    }

    /// Sleeps before the next attempt. Returns false when shut down meanwhile.
    async fn backoff(&mut self, attempt: u32) -> bool {
        let delay = self.options.reconnect.delay(attempt);
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnecting");

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

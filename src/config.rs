// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Configuration
//!
//! The topology descriptor handed to the server at construction: broker URI,
//! connection options, consumer behavior and the exchanges to assert. It can
//! be built in code or loaded from a configuration file merged with
//! environment variables.

use crate::{consumer::FailurePolicy, errors::AmqpError, exchange::ExchangeSpec};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Prefix of the environment variables read by [`BrokerConfig::from_env`].
pub const ENV_PREFIX: &str = "RABBITMQ";

/// Exponential backoff applied between connection attempts.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay to wait before the connection attempt following `attempt`
    /// consecutive failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Options used when opening the broker connection.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    /// Name reported to the broker, also used to identify the channel in events
    pub connection_name: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Applied with `basic.qos` every time the channel is (re)established
    pub prefetch_count: Option<u16>,
}

/// Options of the consumer loop.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub failure_policy: FailurePolicy,
    /// Skip empty bodies without acknowledging them instead of handling
    /// them as an empty payload.
    pub skip_empty_body: bool,
}

/// Configuration of the broker server. Immutable once the server is built.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerConfig {
    pub uri: String,
    #[serde(default, alias = "conn_options")]
    pub connection: ConnectionOptions,
    #[serde(default)]
    pub consumer: ConsumerOptions,
    #[serde(default)]
    pub exchanges: Vec<ExchangeSpec>,
}

impl BrokerConfig {
    pub fn new(uri: &str) -> BrokerConfig {
        BrokerConfig {
            uri: uri.to_owned(),
            connection: ConnectionOptions::default(),
            consumer: ConsumerOptions::default(),
            exchanges: vec![],
        }
    }

    /// Adds an exchange to assert on every connection.
    pub fn exchange(mut self, spec: ExchangeSpec) -> Self {
        self.exchanges.push(spec);
        self
    }

    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection = options;
        self
    }

    pub fn consumer_options(mut self, options: ConsumerOptions) -> Self {
        self.consumer = options;
        self
    }

    /// Loads the configuration from `path` (any format supported by the
    /// `config` crate, the extension may be omitted) and overrides it with
    /// `RABBITMQ__*` environment variables.
    pub fn load(path: &str) -> Result<BrokerConfig, AmqpError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        Self::build(builder)
    }

    /// Loads the configuration from environment variables only, e.g.
    /// `RABBITMQ__URI` or `RABBITMQ__CONNECTION__PREFETCH_COUNT`.
    pub fn from_env() -> Result<BrokerConfig, AmqpError> {
        let builder =
            Config::builder().add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<BrokerConfig, AmqpError> {
        builder
            .build()
            .and_then(|cfg| cfg.try_deserialize::<BrokerConfig>())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to load broker configuration");
                AmqpError::ConfigError(err.to_string())
            })
    }
}

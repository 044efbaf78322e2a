// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Setup
//!
//! Registers the assertion of the configured exchanges as a setup action of
//! the shared channel, so they are (re)declared on every connection before
//! any subscriber queue gets bound to them.

use crate::{
    channel::AmqpChannel,
    config::BrokerConfig,
    connection::{ChannelWrapper, SetupAction},
    errors::AmqpError,
    exchange::ExchangeSpec,
};
use async_trait::async_trait;
use futures_util::future::try_join_all;
use std::sync::Arc;
use tracing::debug;

/// Setup action asserting a set of exchanges concurrently.
pub struct ExchangeSetup {
    exchanges: Vec<ExchangeSpec>,
}

impl ExchangeSetup {
    pub fn new(exchanges: Vec<ExchangeSpec>) -> ExchangeSetup {
        ExchangeSetup { exchanges }
    }
}

#[async_trait]
impl SetupAction for ExchangeSetup {
    fn label(&self) -> String {
        let names: Vec<&str> = self.exchanges.iter().map(|e| e.name.as_str()).collect();
        format!("exchanges [{}]", names.join(", "))
    }

    async fn apply(&self, channel: Arc<dyn AmqpChannel>) -> Result<(), AmqpError> {
        if self.exchanges.is_empty() {
            return Ok(());
        }

        try_join_all(
            self.exchanges
                .iter()
                .map(|exchange| channel.declare_exchange(exchange)),
        )
        .await?;

        debug!("{} exchanges declared", self.exchanges.len());
        Ok(())
    }
}

/// Registers the exchanges of `config` on `channel`.
pub async fn setup_exchanges(
    channel: &ChannelWrapper,
    config: &BrokerConfig,
) -> Result<(), AmqpError> {
    channel
        .add_setup(Arc::new(ExchangeSetup::new(config.exchanges.clone())))
        .await
}

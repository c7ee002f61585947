// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer-Side Topology Installation
//!
//! This module declares the exchanges, queues, and bindings a channel worker
//! needs before it starts consuming. Declarations are idempotent on the broker
//! side, so every worker installs the topology of its own binding set during
//! its subscribe phase.

use crate::{errors::AmqpError, registry::ConsumerBinding};
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Declares and binds the topology for one binding set.
///
/// For each binding this declares a durable direct exchange, a durable queue,
/// and the queue-to-exchange binding with the routing key.
///
/// # Returns
/// Ok(()) on success or AmqpError on the first failed declaration
pub async fn install(channel: &Channel, bindings: &[Arc<ConsumerBinding>]) -> Result<(), AmqpError> {
    for binding in bindings {
        debug!(
            exchange = binding.exchange,
            queue = binding.queue,
            routing_key = binding.routing_key,
            "installing binding topology"
        );

        if let Err(err) = channel
            .exchange_declare(
                &binding.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = binding.exchange,
                "error to declare the exchange"
            );
            return Err(AmqpError::DeclareExchangeError(binding.exchange.clone()));
        }

        if let Err(err) = channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                name = binding.queue,
                "error to declare the queue"
            );
            return Err(AmqpError::DeclareQueueError(binding.queue.clone()));
        }

        if let Err(err) = channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            error!(
                error = err.to_string(),
                "error to bind queue to exchange"
            );
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange.clone(),
                binding.queue.clone(),
            ));
        }
    }

    Ok(())
}

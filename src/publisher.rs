// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delayed Requeue Republisher
//!
//! When a handler fails and a requeue delay is configured, the original
//! delivery is nacked without requeue and its body is republished onto the
//! same queue after the delay. Each republish increments a requeue-count
//! header so redelivery stays bounded even without a broker-level dead-letter
//! policy.

use crate::{context::Codec, context::Delivery, errors::AmqpError, otel::AmqpTracePropagator};
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, LongLongInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{global, Context};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::error;
use uuid::Uuid;

/// Header carrying the number of delayed republish rounds a message went through
pub const AMQP_HEADERS_REQUEUE_COUNT: &str = "x-requeue-count";

/// Extracts the requeue count from message headers.
pub(crate) fn requeue_count(headers: &FieldTable) -> i64 {
    match headers.inner().get(AMQP_HEADERS_REQUEUE_COUNT) {
        Some(value) => value.as_long_long_int().unwrap_or_default(),
        None => 0,
    }
}

/// Republishes failed deliveries onto their queue after a delay.
pub struct Republisher {
    channel: Arc<Channel>,
    codec: Arc<dyn Codec>,
}

impl Republisher {
    /// Creates a new republisher over the given channel.
    pub fn new(channel: Arc<Channel>, codec: Arc<dyn Codec>) -> Republisher {
        Republisher { channel, codec }
    }

    /// Republishes a delivery onto its queue after the requeue delay.
    ///
    /// The message keeps its headers, gets a fresh message id, an incremented
    /// requeue count, and the current trace context injected for the next
    /// consumer span.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context of the failed processing attempt
    /// * `queue` - Queue the message is returned to
    /// * `delivery` - The failed delivery
    /// * `attempt` - Requeue count to record on the republished message
    /// * `delay` - Configured requeue delay
    pub async fn republish_after(
        &self,
        ctx: &Context,
        queue: &str,
        delivery: &Delivery,
        attempt: i64,
        delay: Duration,
    ) -> Result<(), AmqpError> {
        sleep(delay).await;

        let mut btree = delivery.headers.inner().clone();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut AmqpTracePropagator::new(&mut btree))
        });

        btree.insert(
            ShortString::from(AMQP_HEADERS_REQUEUE_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(attempt)),
        );

        match self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &delivery.body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(self.codec.content_type()))
                    .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
                    .with_headers(FieldTable::from(btree)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error republishing message");
                Err(AmqpError::RequeuingMessageError)
            }
            _ => Ok(()),
        }
    }
}

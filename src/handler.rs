// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers and Declarative Bindings
//!
//! This module provides the handler seam between the channel workers and the
//! application. Handlers are registered declaratively: a handler descriptor
//! carries one or more exchange labels plus one or more (queue, routing key)
//! routes, each pointing at a function reference with a typed context
//! argument. There is no runtime reflection; descriptors are plain data.

use crate::{
    context::{BusContext, Codec, Delivery},
    errors::AmqpError,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::{any::type_name, future::Future, marker::PhantomData, sync::Arc};

/// Trait for application message handlers.
///
/// A handler processes exactly one delivery at a time and must not return
/// before message processing completes; the channel worker awaits it before
/// issuing the ack or nack. Implementations are shared across workers and
/// must be thread-safe.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Processes one delivery.
    ///
    /// # Returns
    /// Ok(()) leads to an ack; any error leads to a nack and, when a requeue
    /// delay is configured, a bounded delayed republish.
    async fn handle(&self, delivery: Delivery, codec: Arc<dyn Codec>) -> Result<(), AmqpError>;
}

/// Adapter that erases the payload type of a handler function.
///
/// The adapter builds the typed [`BusContext`] per delivery and awaits the
/// user future. Decoding inside the context stays lazy.
struct FnHandler<T, F> {
    func: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler for FnHandler<T, F>
where
    T: DeserializeOwned + Send + Sync + 'static,
    F: Fn(BusContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn handle(&self, delivery: Delivery, codec: Arc<dyn Codec>) -> Result<(), AmqpError> {
        let ctx = BusContext::new(delivery, codec);
        (self.func)(ctx).await
    }
}

/// One (queue, routing key) route of a handler descriptor.
///
/// Carries the erased handler plus the name of the payload type it expects,
/// used by the dispatch registry to reject ambiguous bindings.
#[derive(Clone)]
pub struct RouteDescriptor {
    pub queue: String,
    pub routing_key: String,
    pub payload_type: &'static str,
    pub handler: Arc<dyn ConsumerHandler>,
}

impl RouteDescriptor {
    /// Creates a route from a typed handler function.
    ///
    /// # Parameters
    /// * `queue` - Queue the route consumes from
    /// * `routing_key` - Routing key bound for this route
    /// * `func` - Handler receiving a typed context per delivery
    pub fn new<T, F, Fut>(queue: &str, routing_key: &str, func: F) -> RouteDescriptor
    where
        T: DeserializeOwned + Send + Sync + 'static,
        F: Fn(BusContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AmqpError>> + Send + 'static,
    {
        RouteDescriptor {
            queue: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            payload_type: type_name::<T>(),
            handler: Arc::new(FnHandler {
                func,
                _payload: PhantomData,
            }),
        }
    }
}

/// Declarative binding metadata for one handler type.
///
/// The descriptor is the registration-time equivalent of exchange and queue
/// annotations: every declared exchange is combined with every declared route
/// when the dispatch registry is built.
#[derive(Clone, Default)]
pub struct HandlerDescriptor {
    pub exchanges: Vec<String>,
    pub routes: Vec<RouteDescriptor>,
}

impl HandlerDescriptor {
    /// Creates an empty descriptor.
    pub fn new() -> HandlerDescriptor {
        HandlerDescriptor::default()
    }

    /// Adds an exchange label to the descriptor.
    pub fn exchange(mut self, name: &str) -> Self {
        self.exchanges.push(name.to_owned());
        self
    }

    /// Adds a (queue, routing key) route to the descriptor.
    pub fn route(mut self, route: RouteDescriptor) -> Self {
        self.routes.push(route);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JsonCodec;
    use lapin::types::FieldTable;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct TestMessage {
        text: String,
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            exchange: "test-exchange".to_owned(),
            routing_key: "test".to_owned(),
            delivery_tag: 7,
            headers: FieldTable::default(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn typed_route_invokes_handler_with_decoded_payload() {
        let route = RouteDescriptor::new("test-queue", "test", |ctx: BusContext<TestMessage>| {
            async move {
                let msg = ctx.message()?;
                assert_eq!(msg.text, "hello");
                Ok(())
            }
        });

        let result = route
            .handler
            .handle(delivery(br#"{"text":"hello"}"#), Arc::new(JsonCodec))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn decode_failure_surfaces_as_handler_failure() {
        let route = RouteDescriptor::new("test-queue", "test", |ctx: BusContext<TestMessage>| {
            async move {
                ctx.message()?;
                Ok(())
            }
        });

        let result = route
            .handler
            .handle(delivery(b"not-json"), Arc::new(JsonCodec))
            .await;

        assert!(matches!(result, Err(AmqpError::DecodeError(_))));
    }

    #[test]
    fn descriptor_records_payload_type() {
        let route = RouteDescriptor::new("q", "k", |_ctx: BusContext<TestMessage>| async move {
            Ok(())
        });
        assert!(route.payload_type.contains("TestMessage"));
    }
}

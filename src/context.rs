// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Context and Payload Codec
//!
//! This module wraps a raw AMQP delivery together with a pluggable payload
//! codec. Decoding is deferred until the handler asks for the typed message,
//! so handlers that only need metadata never pay the deserialization cost.

use crate::errors::AmqpError;
use lapin::types::FieldTable;
use serde::de::DeserializeOwned;
use std::{marker::PhantomData, sync::Arc};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// An owned snapshot of a single AMQP delivery.
///
/// The snapshot is created by the channel worker when a message arrives and
/// is discarded after the handler completes. Acknowledgment stays with the
/// worker; the handler only sees this read-only view.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub headers: FieldTable,
    pub body: Vec<u8>,
}

/// Narrow interface for decoding raw message bodies.
///
/// The codec produces a JSON value model; typed deserialization on top of it
/// is handled by [`BusContext`]. Implementations must be cheap to share
/// across workers.
pub trait Codec: Send + Sync {
    /// Decodes a raw body into a JSON value.
    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, AmqpError>;

    /// Content type advertised when republishing messages.
    fn content_type(&self) -> &'static str;
}

/// JSON implementation of the [`Codec`] trait.
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, body: &[u8]) -> Result<serde_json::Value, AmqpError> {
        serde_json::from_slice(body).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

/// Typed view over a [`Delivery`] handed to a message handler.
///
/// The payload is decoded lazily: [`BusContext::message`] runs the codec on
/// first demand, and a decode failure surfaces as `DecodeError`, which the
/// channel worker treats as a handler failure.
pub struct BusContext<T> {
    delivery: Delivery,
    codec: Arc<dyn Codec>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> BusContext<T>
where
    T: DeserializeOwned,
{
    /// Creates a new context for the given delivery.
    pub fn new(delivery: Delivery, codec: Arc<dyn Codec>) -> BusContext<T> {
        BusContext {
            delivery,
            codec,
            _payload: PhantomData,
        }
    }

    /// Decodes the message body into the typed payload.
    ///
    /// # Returns
    /// The decoded payload, or `DecodeError` when the body is not valid for
    /// the codec or the payload type.
    pub fn message(&self) -> Result<T, AmqpError> {
        let value = self.codec.decode(&self.delivery.body)?;
        serde_json::from_value(value).map_err(|err| AmqpError::DecodeError(err.to_string()))
    }

    /// Name of the exchange the message was published to.
    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    /// Broker-assigned delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Message headers.
    pub fn headers(&self) -> &FieldTable {
        &self.delivery.headers
    }

    /// Raw message body.
    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize, Debug, PartialEq)]
    struct TestMessage {
        text: String,
    }

    fn delivery(body: &[u8]) -> Delivery {
        Delivery {
            exchange: "test-exchange".to_owned(),
            routing_key: "test".to_owned(),
            delivery_tag: 1,
            headers: FieldTable::default(),
            body: body.to_vec(),
        }
    }

    #[test]
    fn message_decodes_valid_json() {
        let ctx: BusContext<TestMessage> =
            BusContext::new(delivery(br#"{"text":"hello"}"#), Arc::new(JsonCodec));

        let msg = ctx.message().unwrap();
        assert_eq!(
            msg,
            TestMessage {
                text: "hello".to_owned()
            }
        );
    }

    #[test]
    fn message_fails_on_invalid_body() {
        let ctx: BusContext<TestMessage> =
            BusContext::new(delivery(b"not-json"), Arc::new(JsonCodec));

        assert!(matches!(ctx.message(), Err(AmqpError::DecodeError(_))));
    }

    #[test]
    fn metadata_is_available_without_decoding() {
        let ctx: BusContext<TestMessage> =
            BusContext::new(delivery(b"not-json"), Arc::new(JsonCodec));

        assert_eq!(ctx.exchange(), "test-exchange");
        assert_eq!(ctx.routing_key(), "test");
        assert_eq!(ctx.delivery_tag(), 1);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Channel Pool
//!
//! This module provides the error types used across the crate. The `AmqpError`
//! enum represents all failure scenarios that can occur during configuration,
//! connection and channel management, queue declaration, message handling, and
//! pool monitoring operations.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ pool operations.
///
/// This enum covers configuration validation, connection and channel lifecycle,
/// topology installation, message consumption, and the management API used by
/// the scaler. Each variant provides specific context about what operation
/// failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Invalid pool or broker configuration, surfaced before startup completes
    #[error("invalid configuration: {0}")]
    ConfigurationError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A connection group reached its channels-per-connection cap
    #[error("connection is at channel capacity")]
    ChannelCapacityError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error creating or running a consumer
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error decoding a message payload
    #[error("failure to decode payload: {0}")]
    DecodeError(String),

    /// A message handler returned a failure
    #[error("handler failure: {0}")]
    HandlerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error republishing a message for delayed requeue
    #[error("failure to requeue message")]
    RequeuingMessageError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error querying the broker management API
    #[error("management api error: {0}")]
    ManagementApiError(String),
}

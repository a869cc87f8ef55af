// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Session Manager
//!
//! This module provides the error type shared by every layer of the session:
//! transport RPC failures, topology rejections, configuration errors detected
//! before any broker traffic, and the terminal outcome of a stopped session.

use thiserror::Error;

/// Represents errors that can occur while driving an AMQP session.
///
/// Transient link failures never reach the caller as one of these values: the
/// session recovers from them by reconnecting. What does reach the caller is a
/// configuration error (returned before anything is sent to the broker), a
/// fatal topology error when the session is configured to treat those as
/// terminal, or an internal failure of the session runtime itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the broker
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or using a channel
    #[error("channel failure `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error switching the channel into publisher-confirm mode
    #[error("failure to enable publisher confirms")]
    ConfirmSelectError,

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// A consumer was started without a message handler
    #[error("consumption requires a message handler")]
    MissingHandler,

    /// The requested operation does not match the configured role
    #[error("session configured as `{configured}` cannot run as `{requested}`")]
    RoleMismatch {
        configured: String,
        requested: String,
    },

    /// The session configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The broker rejected the topology and the session treats that as fatal
    #[error("topology rejected by the broker: {0}")]
    Topology(String),
}

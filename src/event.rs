// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Events and Commands
//!
//! The vocabulary of the session state machine. Everything that happens to a
//! session (caller requests, timers, broker notifications, RPC completions)
//! arrives as an [`Event`] on a single serialized queue; everything the state
//! machine wants done comes out as a [`Command`] for the runtime to execute.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Delivery, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
};
use std::{fmt, time::Duration};

/// Reply code used for every close the session initiates itself
pub const REPLY_SUCCESS: u16 = 200;

/// Connection epoch. Allocated fresh for every connect attempt so signals
/// produced by an earlier connection (or its channel) can be told apart and
/// dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub(crate) u64);

impl Generation {
    pub(crate) fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Broker verdict on a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Ack,
    Nack,
}

/// Something that happened on a particular connection or its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    ConnectionOpened,
    ConnectFailed { reason: String },
    ConnectionClosed { code: u16, reason: String },
    ChannelOpened,
    ChannelClosed { code: u16, reason: String },
    ExchangeDeclared,
    QueueDeclared,
    QueueBound,
    ConfirmsEnabled,
    TopologyFailed { reason: String },
    PublishDue,
    Confirmed { delivery_tag: u64, outcome: ConfirmOutcome },
    ConsumeOk { consumer_tag: String },
    Delivered(Delivery),
    /// The broker cancelled the consumer on its own initiative.
    ConsumerCancelled,
    /// The broker acknowledged a cancel the session requested.
    CancelOk,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    StopRequested,
    ReconnectDue,
    Link(Generation, LinkSignal),
}

/// I/O requested by the state machine, executed in order by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect {
        generation: Generation,
        url: String,
    },
    ScheduleReconnect(Duration),
    CancelReconnect,
    OpenChannel,
    DeclareExchange(ExchangeDefinition),
    DeclareQueue(QueueDefinition),
    BindQueue(QueueBinding),
    EnableConfirms,
    Publish {
        delivery_tag: u64,
        exchange: String,
        routing_key: String,
        body: Vec<u8>,
        properties: MessageProperties,
    },
    SchedulePublish(Duration),
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Ack(u64),
    Dispatch(Delivery),
    Cancel(String),
    CloseChannel,
    CloseConnection,
    Finish(Result<(), AmqpError>),
}

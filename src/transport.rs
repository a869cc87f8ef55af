// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Seam
//!
//! The session never talks to a broker client library directly. It drives
//! these traits, which cover exactly the RPCs the session needs, and receives
//! everything the broker does on its own (closures, confirms, deliveries,
//! consumer cancellations) through a [`LinkEvents`] handle.
//!
//! [`crate::amqp::LapinTransport`] is the production implementation.

use crate::{
    errors::AmqpError,
    event::{ConfirmOutcome, Event, Generation, LinkSignal},
    exchange::ExchangeDefinition,
    message::{Delivery, MessageProperties},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Opens connections to a broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connects to `url`.
    ///
    /// Implementations arm their closure notification on `events` as early as
    /// their client allows, and always before returning the connection. A
    /// closure the client reports before the hook is armed surfaces as a
    /// failure of the next RPC on the connection, which the session treats
    /// like a lost channel.
    async fn connect(
        &self,
        url: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    /// Opens a channel whose closures, confirms and deliveries are reported
    /// on `events`.
    async fn open_channel(
        &self,
        events: LinkEvents,
    ) -> Result<Arc<dyn TransportChannel>, AmqpError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Switches the channel into publisher-confirm mode.
    async fn enable_publisher_confirms(&self) -> Result<(), AmqpError>;

    /// Hands a message to the channel. `delivery_tag` is the sequence number
    /// the broker will confirm it under; the confirmation, when confirms are
    /// enabled, is reported with [`LinkEvents::confirmed`].
    async fn publish(
        &self,
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError>;

    /// Subscribes to `queue`; deliveries are reported with
    /// [`LinkEvents::delivered`].
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError>;
}

/// Reports broker-initiated activity of one connection (and its channel) to
/// the session loop.
///
/// Cheap to clone. Every report is stamped with the generation of the
/// connection it was handed out for, so a handle kept alive by a dead
/// connection can't affect the session any more.
#[derive(Debug, Clone)]
pub struct LinkEvents {
    generation: Generation,
    tx: UnboundedSender<Event>,
}

impl LinkEvents {
    pub(crate) fn new(generation: Generation, tx: UnboundedSender<Event>) -> LinkEvents {
        LinkEvents { generation, tx }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub(crate) fn post(&self, signal: LinkSignal) {
        if self.tx.send(Event::Link(self.generation, signal)).is_err() {
            debug!(generation = %self.generation, "session loop is gone, dropping signal");
        }
    }

    pub fn connection_closed(&self, code: u16, reason: &str) {
        self.post(LinkSignal::ConnectionClosed {
            code,
            reason: reason.to_owned(),
        });
    }

    pub fn channel_closed(&self, code: u16, reason: &str) {
        self.post(LinkSignal::ChannelClosed {
            code,
            reason: reason.to_owned(),
        });
    }

    pub fn confirmed(&self, delivery_tag: u64, outcome: ConfirmOutcome) {
        self.post(LinkSignal::Confirmed {
            delivery_tag,
            outcome,
        });
    }

    pub fn delivered(&self, delivery: Delivery) {
        self.post(LinkSignal::Delivered(delivery));
    }

    pub fn consumer_cancelled(&self) {
        self.post(LinkSignal::ConsumerCancelled);
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Consumer
//!
//! Subscribes to the session's queue once topology is installed and turns
//! every delivery into an optional acknowledgement followed by a dispatch to
//! the message handler. The ack is sent before the handler runs, so a handler
//! failure does not lead to redelivery.
//!
//! A consumer on a one-time queue stops after its first delivery: once the
//! handler has been dispatched, the session cancels the consumer and closes
//! the channel and connection, and the auto-delete queue disappears with it.

use crate::{config::SessionConfig, event::Command, message::Delivery};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of the subscription on the current channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No subscription requested on this channel.
    Idle,
    /// `basic.consume` sent, waiting for `consume-ok`.
    Subscribing,
    /// The broker is delivering messages.
    Active,
    /// `basic.cancel` sent, waiting for `cancel-ok`.
    Cancelling,
    /// The subscription ended, by request or by the broker.
    Cancelled,
}

/// The consuming side of a session.
///
/// Holds the subscription state and counts handled messages; the I/O it needs
/// is returned as [`Command`]s.
#[derive(Debug)]
pub struct Consumer {
    queue: String,
    app_id: String,
    acked: bool,
    one_time: bool,
    state: ConsumerState,
    consumer_tag: Option<String>,
    handled: u64,
}

impl Consumer {
    /// Creates a consumer for the queue, ack mode and one-time flag of `cfg`.
    pub fn new(cfg: &SessionConfig) -> Consumer {
        Consumer {
            queue: cfg.queue_name().to_owned(),
            app_id: cfg.app_id.clone(),
            acked: cfg.acked,
            one_time: cfg.one_time,
            state: ConsumerState::Idle,
            consumer_tag: None,
            handled: 0,
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Tag of the current subscription, generated client-side as
    /// `<app_id>-<uuid>`.
    pub fn consumer_tag(&self) -> Option<&str> {
        self.consumer_tag.as_deref()
    }

    /// Number of messages dispatched over the whole session.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Topology is installed; subscribes to the queue with a fresh consumer
    /// tag. Broker-side auto-ack is never requested.
    pub fn on_ready(&mut self, out: &mut Vec<Command>) {
        if !matches!(self.state, ConsumerState::Idle | ConsumerState::Cancelled) {
            warn!(state = ?self.state, "consumer already subscribed");
            return;
        }

        let consumer_tag = format!("{}-{}", self.app_id, Uuid::new_v4());
        info!(queue = %self.queue, consumer_tag = %consumer_tag, "consuming started");

        self.state = ConsumerState::Subscribing;
        self.consumer_tag = Some(consumer_tag.clone());
        out.push(Command::Consume {
            queue: self.queue.clone(),
            consumer_tag,
        });
    }

    /// The broker confirmed the subscription. A `consume-ok` for another tag
    /// belongs to an earlier subscription and is ignored.
    pub fn on_subscribed(&mut self, consumer_tag: &str) {
        if self.state != ConsumerState::Subscribing || self.consumer_tag() != Some(consumer_tag) {
            debug!(state = ?self.state, consumer_tag, "ignoring consume-ok");
            return;
        }

        debug!(consumer_tag, "consumer registered");
        self.state = ConsumerState::Active;
    }

    /// Handles a delivery: acks it when acknowledgements are enabled, then
    /// dispatches it to the handler. Deliveries arriving outside a live
    /// subscription are ignored.
    ///
    /// Returns `true` when this was the single message of a one-time queue and
    /// the session has to shut down.
    pub fn on_delivery(&mut self, delivery: Delivery, out: &mut Vec<Command>) -> bool {
        if !matches!(self.state, ConsumerState::Subscribing | ConsumerState::Active) {
            debug!(
                state = ?self.state,
                delivery_tag = delivery.delivery_tag,
                "not consuming, ignoring delivery"
            );
            return false;
        }

        info!(
            delivery_tag = delivery.delivery_tag,
            app_id = ?delivery.metadata.app_id,
            "message received"
        );

        if self.acked {
            debug!(delivery_tag = delivery.delivery_tag, "acknowledging message");
            out.push(Command::Ack(delivery.delivery_tag));
        }

        self.handled += 1;
        out.push(Command::Dispatch(delivery));

        self.one_time
    }

    /// Requests cancellation of the subscription.
    ///
    /// Returns `false` when there is nothing to cancel.
    pub fn cancel(&mut self, out: &mut Vec<Command>) -> bool {
        if !matches!(self.state, ConsumerState::Subscribing | ConsumerState::Active) {
            return false;
        }

        let Some(consumer_tag) = self.consumer_tag.clone() else {
            return false;
        };

        info!(consumer_tag = %consumer_tag, "sending a basic.cancel");
        self.state = ConsumerState::Cancelling;
        out.push(Command::Cancel(consumer_tag));
        true
    }

    /// The broker confirmed a requested cancellation.
    ///
    /// Returns `true` when the session can go on closing the channel.
    pub fn on_cancel_ok(&mut self) -> bool {
        if self.state != ConsumerState::Cancelling {
            debug!(state = ?self.state, "ignoring cancel-ok");
            return false;
        }

        info!("broker acknowledged the cancellation of the consumer");
        self.state = ConsumerState::Cancelled;
        true
    }

    /// The broker cancelled the subscription on its own, e.g. because the
    /// queue was deleted.
    ///
    /// Returns `true` when a live subscription ended and the session has to
    /// shut down.
    pub fn on_server_cancel(&mut self) -> bool {
        if !matches!(self.state, ConsumerState::Subscribing | ConsumerState::Active) {
            return false;
        }

        info!(consumer_tag = ?self.consumer_tag, "consumer was cancelled remotely");
        self.state = ConsumerState::Cancelled;
        true
    }

    /// The channel is gone and the subscription with it. A new one is made
    /// once topology is installed on the next channel.
    pub fn on_channel_lost(&mut self) {
        self.state = ConsumerState::Idle;
        self.consumer_tag = None;
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! Publishes onto the session's exchange and keeps the bookkeeping for
//! publisher confirms: every message handed to the channel gets the next
//! delivery tag of that channel, and stays pending until the broker acks or
//! nacks it. Nothing is ever resent by this layer; records still pending when
//! their channel goes away are dropped.

use crate::{
    config::SessionConfig,
    event::{Command, ConfirmOutcome},
    message::{MessageProperties, Payload},
};
use std::{collections::BTreeSet, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a publisher session sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishMode {
    /// Send one message, wait for its confirmation, then shut down.
    OneShot(Payload),
    /// Send the payload every `interval` until stopped, without waiting for
    /// confirmations in between.
    Continuous { payload: Payload, interval: Duration },
}

#[derive(Debug)]
pub struct Publisher {
    exchange: String,
    routing_key: String,
    app_id: String,
    confirms: bool,
    mode: PublishMode,
    ready: bool,
    done: bool,
    message_number: u64,
    deliveries: BTreeSet<u64>,
    acked: u64,
    nacked: u64,
    published: u64,
    dropped: u64,
}

impl Publisher {
    pub fn new(cfg: &SessionConfig, mode: PublishMode) -> Publisher {
        Publisher {
            exchange: cfg.exchange.clone(),
            routing_key: cfg.routing_key.clone(),
            app_id: cfg.app_id.clone(),
            confirms: cfg.acked,
            mode,
            ready: false,
            done: false,
            message_number: 0,
            deliveries: BTreeSet::new(),
            acked: 0,
            nacked: 0,
            published: 0,
            dropped: 0,
        }
    }

    /// The channel finished installing topology; starts sending.
    ///
    /// Returns `true` when a one-shot publish is complete right away, which is
    /// the case when confirmations are disabled.
    pub fn on_ready(&mut self, out: &mut Vec<Command>) -> bool {
        self.ready = true;

        if let PublishMode::Continuous { interval, .. } = &self.mode {
            debug!(interval = ?interval, "scheduling first message");
            out.push(Command::SchedulePublish(*interval));
            return false;
        }

        if self.done {
            return true;
        }

        self.publish(out);
        if !self.confirms {
            debug!("confirmations disabled, one-shot publish complete");
            self.done = true;
        }
        self.done
    }

    /// Timer tick in continuous mode.
    pub fn on_publish_due(&mut self, stopping: bool, out: &mut Vec<Command>) {
        if stopping || !self.ready {
            debug!(stopping, ready = self.ready, "skipping scheduled publish");
            return;
        }

        let PublishMode::Continuous { interval, .. } = &self.mode else {
            return;
        };
        let interval = *interval;

        self.publish(out);
        out.push(Command::SchedulePublish(interval));
    }

    fn publish(&mut self, out: &mut Vec<Command>) {
        let payload = match &self.mode {
            PublishMode::OneShot(payload) => payload,
            PublishMode::Continuous { payload, .. } => payload,
        };

        self.message_number += 1;
        let delivery_tag = self.message_number;

        let properties = MessageProperties {
            content_type: payload.content_type().to_owned(),
            app_id: self.app_id.clone(),
            message_id: Uuid::new_v4().to_string(),
            headers: Default::default(),
        };

        out.push(Command::Publish {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: payload.body().to_vec(),
            properties,
        });

        if self.confirms {
            self.deliveries.insert(delivery_tag);
        }
        self.published += 1;

        info!(delivery_tag, "published message # {}", delivery_tag);
    }

    /// Resolves a delivery record.
    ///
    /// Returns `true` when this completes a one-shot publish.
    pub fn on_confirm(&mut self, delivery_tag: u64, outcome: ConfirmOutcome) -> bool {
        if !self.deliveries.remove(&delivery_tag) {
            warn!(delivery_tag, ?outcome, "confirmation for an unknown delivery");
            return false;
        }

        match outcome {
            ConfirmOutcome::Ack => self.acked += 1,
            ConfirmOutcome::Nack => self.nacked += 1,
        }

        info!(
            "received {:?} for {}: published {} messages, {} yet to confirm, {} acked and {} nacked",
            outcome,
            delivery_tag,
            self.message_number,
            self.deliveries.len(),
            self.acked,
            self.nacked
        );

        if matches!(self.mode, PublishMode::OneShot(_)) {
            self.done = true;
        }
        self.done
    }

    /// The channel is gone: pending records are dropped and the delivery tag
    /// sequence starts over on the next channel.
    pub fn on_channel_lost(&mut self) {
        self.ready = false;
        self.drop_pending();
        self.message_number = 0;
        self.acked = 0;
        self.nacked = 0;
    }

    /// Drops every unresolved record.
    pub fn drop_pending(&mut self) {
        if self.deliveries.is_empty() {
            return;
        }

        warn!(
            pending = ?self.deliveries,
            "dropping {} unconfirmed deliveries",
            self.deliveries.len()
        );
        self.dropped += self.deliveries.len() as u64;
        self.deliveries.clear();
    }

    pub fn pending(&self) -> Vec<u64> {
        self.deliveries.iter().copied().collect()
    }

    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn nacked(&self) -> u64 {
        self.nacked
    }

    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

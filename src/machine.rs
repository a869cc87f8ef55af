// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session State Machine
//!
//! Composes the connection, channel, topology and publisher/consumer state
//! machines into the session's lifecycle. [`StateMachine::handle`] takes one
//! event at a time and returns the commands to execute; it performs no I/O.
//!
//! Signals stamped with a generation other than the current connection's are
//! dropped before they reach any component, so nothing from a replaced
//! connection (a late confirm, a delivery, a close notification) can touch the
//! state of its successor.

use crate::{
    channel::{ChannelClosure, ChannelState, ChannelSupervisor},
    config::{Role, SessionConfig, TopologyFailurePolicy},
    connection::{Closure, ConnectionState, ConnectionSupervisor},
    consumer::Consumer,
    errors::AmqpError,
    event::{Command, Event, Generation, LinkSignal},
    publisher::{PublishMode, Publisher},
    topology::{TopologyInstaller, TopologyStep},
};
use tracing::{debug, info};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    WaitingToReconnect,
    OpeningChannel,
    InstallingTopology,
    Ready,
    Stopping,
    Finished,
}

/// Counters of a finished (or running) session.
///
/// Confirmation counters cover the last channel lifetime only; they start
/// over with every reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub published: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dropped: u64,
    pub handled: u64,
    pub reconnects: u64,
}

#[derive(Debug)]
enum Worker {
    Publisher(Publisher),
    Consumer(Consumer),
}

#[derive(Debug)]
pub struct StateMachine {
    policy: TopologyFailurePolicy,
    connection: ConnectionSupervisor,
    channel: ChannelSupervisor,
    topology: TopologyInstaller,
    worker: Worker,
    stopping: bool,
    failure: Option<AmqpError>,
    finished: bool,
}

impl StateMachine {
    pub fn publisher(cfg: &SessionConfig, mode: PublishMode) -> StateMachine {
        StateMachine::new(cfg, Worker::Publisher(Publisher::new(cfg, mode)))
    }

    pub fn consumer(cfg: &SessionConfig) -> StateMachine {
        StateMachine::new(cfg, Worker::Consumer(Consumer::new(cfg)))
    }

    fn new(cfg: &SessionConfig, worker: Worker) -> StateMachine {
        let role = match worker {
            Worker::Publisher(_) => Role::Publisher,
            Worker::Consumer(_) => Role::Consumer,
        };

        StateMachine {
            policy: cfg.topology_failure,
            connection: ConnectionSupervisor::new(&cfg.url, cfg.reconnect_interval()),
            channel: ChannelSupervisor::new(),
            topology: TopologyInstaller::new(
                cfg.exchange_definition(),
                cfg.queue_definition(),
                cfg.queue_binding(),
                cfg.acked && role == Role::Publisher,
            ),
            worker,
            stopping: false,
            failure: None,
            finished: false,
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Command> {
        let mut out = vec![];

        if self.finished {
            debug!(?event, "session finished, ignoring event");
            return out;
        }

        match event {
            Event::Start => self.connection.start(&mut out),
            Event::StopRequested => {
                info!("stopping");
                self.begin_stop(&mut out);
            }
            Event::ReconnectDue => self.connection.on_reconnect_due(&mut out),
            Event::Link(generation, signal) => {
                if generation == self.connection.generation() {
                    self.on_link(signal, &mut out);
                } else {
                    debug!(
                        %generation,
                        current = %self.connection.generation(),
                        ?signal,
                        "dropping signal of a previous connection"
                    );
                }
            }
        }

        out
    }

    fn on_link(&mut self, signal: LinkSignal, out: &mut Vec<Command>) {
        match signal {
            LinkSignal::ConnectionOpened => {
                if !self.connection.on_open() {
                    return;
                }
                if self.stopping {
                    self.connection.close(out);
                } else {
                    self.channel.open(out);
                }
            }
            LinkSignal::ConnectFailed { reason } => self.on_connection_closed(0, &reason, out),
            LinkSignal::ConnectionClosed { code, reason } => {
                self.on_connection_closed(code, &reason, out)
            }
            LinkSignal::ChannelOpened => {
                if !self.channel.on_open() {
                    return;
                }
                if self.stopping {
                    self.channel.close(out);
                } else {
                    self.topology.install(out);
                }
            }
            LinkSignal::ChannelClosed { code, reason } => self.on_channel_closed(code, &reason, out),
            LinkSignal::ExchangeDeclared => {
                if !self.abort_topology_if_stopping(out) {
                    self.topology.on_exchange_declared(out);
                }
            }
            LinkSignal::QueueDeclared => {
                if !self.abort_topology_if_stopping(out) {
                    self.topology.on_queue_declared(out);
                }
            }
            LinkSignal::QueueBound => {
                if !self.abort_topology_if_stopping(out) && self.topology.on_bound(out) {
                    self.on_installed(out);
                }
            }
            LinkSignal::ConfirmsEnabled => {
                if !self.abort_topology_if_stopping(out) && self.topology.on_confirms_enabled() {
                    self.on_installed(out);
                }
            }
            LinkSignal::TopologyFailed { reason } => self.on_topology_failed(&reason, out),
            LinkSignal::PublishDue => {
                let blocked = self.stopping || !self.channel.is_open();
                if let Worker::Publisher(publisher) = &mut self.worker {
                    publisher.on_publish_due(blocked, out);
                }
            }
            LinkSignal::Confirmed {
                delivery_tag,
                outcome,
            } => {
                if let Worker::Publisher(publisher) = &mut self.worker {
                    if publisher.on_confirm(delivery_tag, outcome) {
                        info!("one-shot publish confirmed, shutting down");
                        self.begin_stop(out);
                    }
                }
            }
            LinkSignal::ConsumeOk { consumer_tag } => {
                if let Worker::Consumer(consumer) = &mut self.worker {
                    consumer.on_subscribed(&consumer_tag);
                }
            }
            LinkSignal::Delivered(delivery) => {
                if self.stopping || !self.channel.is_open() {
                    debug!(
                        delivery_tag = delivery.delivery_tag,
                        "channel is going away, ignoring delivery"
                    );
                    return;
                }
                if let Worker::Consumer(consumer) = &mut self.worker {
                    if consumer.on_delivery(delivery, out) {
                        info!("one-time queue served, shutting down");
                        self.begin_stop(out);
                    }
                }
            }
            LinkSignal::ConsumerCancelled => {
                if let Worker::Consumer(consumer) = &mut self.worker {
                    if consumer.on_server_cancel() {
                        self.begin_stop(out);
                    }
                }
            }
            LinkSignal::CancelOk => {
                if let Worker::Consumer(consumer) = &mut self.worker {
                    if consumer.on_cancel_ok() {
                        self.channel.close(out);
                    }
                }
            }
        }
    }

    fn abort_topology_if_stopping(&mut self, out: &mut Vec<Command>) -> bool {
        if self.stopping {
            debug!(step = ?self.topology.step(), "stopping, abandoning topology installation");
            self.channel.close(out);
        }
        self.stopping
    }

    fn on_installed(&mut self, out: &mut Vec<Command>) {
        match &mut self.worker {
            Worker::Publisher(publisher) => {
                if publisher.on_ready(out) {
                    self.begin_stop(out);
                }
            }
            Worker::Consumer(consumer) => consumer.on_ready(out),
        }
    }

    fn on_channel_closed(&mut self, code: u16, reason: &str, out: &mut Vec<Command>) {
        match self.channel.on_closed(code, reason, self.stopping) {
            ChannelClosure::Ignored => {}
            ChannelClosure::Expected => {
                self.lose_channel(true);
                self.connection.close(out);
            }
            ChannelClosure::Abnormal => {
                self.lose_channel(false);
                self.connection.close(out);
            }
        }
    }

    fn on_connection_closed(&mut self, code: u16, reason: &str, out: &mut Vec<Command>) {
        let Some(closure) = self.connection.on_closed(code, reason, out) else {
            return;
        };

        self.channel.reset();
        match closure {
            Closure::Unexpected => self.lose_channel(false),
            Closure::Expected => {
                self.lose_channel(true);
                self.finish(out);
            }
        }
    }

    fn on_topology_failed(&mut self, reason: &str, out: &mut Vec<Command>) {
        self.topology.on_failed(reason);

        match self.policy {
            TopologyFailurePolicy::Retry => self.on_channel_closed(0, reason, out),
            TopologyFailurePolicy::Fatal => {
                self.failure = Some(AmqpError::Topology(reason.to_owned()));
                self.channel.on_closed(0, reason, true);
                self.lose_channel(true);
                self.begin_stop(out);
            }
        }
    }

    /// Drops the per-channel state of the publisher or consumer. A channel
    /// closed during shutdown keeps its counters for the report.
    fn lose_channel(&mut self, shutting_down: bool) {
        self.topology.reset();
        match &mut self.worker {
            Worker::Publisher(publisher) if shutting_down => publisher.drop_pending(),
            Worker::Publisher(publisher) => publisher.on_channel_lost(),
            Worker::Consumer(consumer) => consumer.on_channel_lost(),
        }
    }

    fn begin_stop(&mut self, out: &mut Vec<Command>) {
        if self.stopping {
            debug!("already stopping");
            return;
        }
        self.stopping = true;

        if self.connection.stop(out) {
            self.lose_channel(true);
            self.finish(out);
            return;
        }

        if !self.connection.is_open() {
            // connecting or closing: the pending notification completes the stop
            return;
        }

        match self.channel.state() {
            ChannelState::Open => {
                if let Worker::Consumer(consumer) = &mut self.worker {
                    if consumer.cancel(out) {
                        return;
                    }
                }
                self.channel.close(out);
            }
            ChannelState::Opening => {}
            ChannelState::None | ChannelState::Closed => self.connection.close(out),
        }
    }

    fn finish(&mut self, out: &mut Vec<Command>) {
        info!(report = ?self.report(), "stopped");
        self.finished = true;
        out.push(Command::Finish(match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }));
    }

    pub fn phase(&self) -> Phase {
        if self.finished {
            return Phase::Finished;
        }
        if self.stopping {
            return Phase::Stopping;
        }

        match self.connection.state() {
            ConnectionState::Disconnected if self.connection.reconnect_pending() => {
                Phase::WaitingToReconnect
            }
            ConnectionState::Disconnected => Phase::Idle,
            ConnectionState::Connecting => Phase::Connecting,
            ConnectionState::Closing | ConnectionState::Closed => Phase::Stopping,
            ConnectionState::Open => match (self.channel.state(), self.topology.step()) {
                (ChannelState::Open, TopologyStep::Installed) => Phase::Ready,
                (ChannelState::Open, _) => Phase::InstallingTopology,
                _ => Phase::OpeningChannel,
            },
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn generation(&self) -> Generation {
        self.connection.generation()
    }

    /// Delivery tags still waiting for a confirmation.
    pub fn pending(&self) -> Vec<u64> {
        match &self.worker {
            Worker::Publisher(publisher) => publisher.pending(),
            Worker::Consumer(_) => vec![],
        }
    }

    pub fn report(&self) -> SessionReport {
        let mut report = SessionReport {
            reconnects: self.connection.reconnects(),
            ..SessionReport::default()
        };

        match &self.worker {
            Worker::Publisher(publisher) => {
                report.published = publisher.published();
                report.acked = publisher.acked();
                report.nacked = publisher.nacked();
                report.dropped = publisher.dropped();
            }
            Worker::Consumer(consumer) => report.handled = consumer.handled(),
        }

        report
    }
}

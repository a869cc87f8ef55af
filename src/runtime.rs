// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session Runtime
//!
//! The event loop of one session. It owns the only receiver of the session's
//! event queue, feeds every event to the [`StateMachine`] and executes the
//! returned commands one after the other, awaiting each transport call before
//! moving on. Completions are posted back into the same queue, so every state
//! change happens on this loop, in the order events were queued.

use crate::{
    dispatcher::{self, MessageHandler},
    errors::AmqpError,
    event::{Command, Event, Generation, LinkSignal, REPLY_SUCCESS},
    machine::{SessionReport, StateMachine},
    otel,
    transport::{LinkEvents, Transport, TransportChannel, TransportConnection},
};
use opentelemetry::global::{self, BoxedTracer};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

const SHUTDOWN_REASON: &str = "normal shutdown";

/// Executes the commands of one [`StateMachine`] against a [`Transport`].
///
/// Holds the live connection and channel handles plus the two timers a
/// session can have pending: the reconnect delay and the next continuous
/// publish.
pub(crate) struct Runtime {
    transport: Arc<dyn Transport>,
    handler: Option<Arc<dyn MessageHandler>>,
    tracer: BoxedTracer,
    tx: UnboundedSender<Event>,
    rx: UnboundedReceiver<Event>,
    link: Option<LinkEvents>,
    connection: Option<Arc<dyn TransportConnection>>,
    channel: Option<Arc<dyn TransportChannel>>,
    reconnect_timer: Option<JoinHandle<()>>,
    publish_timer: Option<JoinHandle<()>>,
}

impl Runtime {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        handler: Option<Arc<dyn MessageHandler>>,
        tx: UnboundedSender<Event>,
        rx: UnboundedReceiver<Event>,
    ) -> Runtime {
        Runtime {
            transport,
            handler,
            tracer: global::tracer("amqp consumer"),
            tx,
            rx,
            link: None,
            connection: None,
            channel: None,
            reconnect_timer: None,
            publish_timer: None,
        }
    }

    /// Drives `machine` from start until it finishes.
    pub(crate) async fn run(mut self, mut machine: StateMachine) -> Result<SessionReport, AmqpError> {
        let mut event = Event::Start;

        loop {
            for command in machine.handle(event) {
                if let Some(outcome) = self.execute(command).await {
                    self.abort_timers();
                    return outcome.map(|_| machine.report());
                }
            }

            event = match self.rx.recv().await {
                Some(event) => event,
                None => {
                    error!("session event queue closed");
                    self.abort_timers();
                    return Err(AmqpError::InternalError);
                }
            };
        }
    }

    /// Executes one command. Returns the session outcome once the machine
    /// asks to finish.
    async fn execute(&mut self, command: Command) -> Option<Result<(), AmqpError>> {
        match command {
            Command::Connect { generation, url } => self.connect(generation, &url).await,
            Command::ScheduleReconnect(delay) => {
                let tx = self.tx.clone();
                Self::replace_timer(
                    &mut self.reconnect_timer,
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        if tx.send(Event::ReconnectDue).is_err() {
                            debug!("session is gone, dropping reconnect");
                        }
                    }),
                );
            }
            Command::CancelReconnect => {
                if let Some(timer) = self.reconnect_timer.take() {
                    timer.abort();
                }
            }
            Command::OpenChannel => self.open_channel().await,
            Command::DeclareExchange(def) => {
                if let Some((channel, link)) = self.channel() {
                    match channel.declare_exchange(&def).await {
                        Ok(_) => link.post(LinkSignal::ExchangeDeclared),
                        Err(err) => topology_failed(&link, err),
                    }
                }
            }
            Command::DeclareQueue(def) => {
                if let Some((channel, link)) = self.channel() {
                    match channel.declare_queue(&def).await {
                        Ok(_) => link.post(LinkSignal::QueueDeclared),
                        Err(err) => topology_failed(&link, err),
                    }
                }
            }
            Command::BindQueue(binding) => {
                if let Some((channel, link)) = self.channel() {
                    match channel.bind_queue(&binding).await {
                        Ok(_) => link.post(LinkSignal::QueueBound),
                        Err(err) => topology_failed(&link, err),
                    }
                }
            }
            Command::EnableConfirms => {
                if let Some((channel, link)) = self.channel() {
                    match channel.enable_publisher_confirms().await {
                        Ok(_) => link.post(LinkSignal::ConfirmsEnabled),
                        Err(err) => topology_failed(&link, err),
                    }
                }
            }
            Command::Publish {
                delivery_tag,
                exchange,
                routing_key,
                body,
                mut properties,
            } => {
                if let Some((channel, link)) = self.channel() {
                    otel::inject_context(&mut properties.headers);
                    if let Err(err) = channel
                        .publish(delivery_tag, &exchange, &routing_key, &body, &properties)
                        .await
                    {
                        channel_failed(&link, err);
                    }
                }
            }
            Command::SchedulePublish(interval) => {
                if let Some(link) = self.link.clone() {
                    Self::replace_timer(&mut self.publish_timer, schedule_publish(link, interval));
                }
            }
            Command::Consume {
                queue,
                consumer_tag,
            } => {
                if let Some((channel, link)) = self.channel() {
                    match channel.consume(&queue, &consumer_tag).await {
                        Ok(_) => link.post(LinkSignal::ConsumeOk { consumer_tag }),
                        Err(err) => channel_failed(&link, err),
                    }
                }
            }
            Command::Ack(delivery_tag) => {
                if let Some((channel, link)) = self.channel() {
                    if let Err(err) = channel.ack(delivery_tag).await {
                        channel_failed(&link, err);
                    }
                }
            }
            Command::Dispatch(delivery) => match &self.handler {
                Some(handler) => {
                    if !dispatcher::dispatch(handler, &self.tracer, &delivery).await {
                        debug!(
                            delivery_tag = delivery.delivery_tag,
                            "handler failed, continuing with the next message"
                        );
                    }
                }
                None => warn!(
                    delivery_tag = delivery.delivery_tag,
                    "no handler registered, dropping message"
                ),
            },
            Command::Cancel(consumer_tag) => {
                if let Some((channel, link)) = self.channel() {
                    match channel.cancel(&consumer_tag).await {
                        Ok(_) => link.post(LinkSignal::CancelOk),
                        Err(err) => channel_failed(&link, err),
                    }
                }
            }
            Command::CloseChannel => self.close_channel().await,
            Command::CloseConnection => self.close_connection().await,
            Command::Finish(outcome) => return Some(outcome),
        }

        None
    }

    /// Opens a connection stamped with `generation`. Any previous connection
    /// and channel handles are dropped first.
    async fn connect(&mut self, generation: Generation, url: &str) {
        // whatever is left of the previous connection is dead by now
        self.channel = None;
        self.connection = None;

        let link = LinkEvents::new(generation, self.tx.clone());
        self.link = Some(link.clone());

        match self.transport.connect(url, link.clone()).await {
            Ok(connection) => {
                self.connection = Some(connection);
                link.post(LinkSignal::ConnectionOpened);
            }
            Err(err) => link.post(LinkSignal::ConnectFailed {
                reason: err.to_string(),
            }),
        }
    }

    async fn open_channel(&mut self) {
        let (Some(connection), Some(link)) = (self.connection.clone(), self.link.clone()) else {
            warn!("no connection to open a channel on");
            return;
        };

        match connection.open_channel(link.clone()).await {
            Ok(channel) => {
                self.channel = Some(channel);
                link.post(LinkSignal::ChannelOpened);
            }
            Err(err) => channel_failed(&link, err),
        }
    }

    /// Closes the channel gracefully and reports the closure itself, since a
    /// requested close produces no client error.
    async fn close_channel(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };

        if let Some(timer) = self.publish_timer.take() {
            timer.abort();
        }

        if let Some(channel) = self.channel.take() {
            if let Err(err) = channel.close(REPLY_SUCCESS, SHUTDOWN_REASON).await {
                debug!(error = err.to_string(), "channel was already closed");
            }
        }
        link.channel_closed(REPLY_SUCCESS, SHUTDOWN_REASON);
    }

    /// Closes the connection gracefully and reports the closure.
    async fn close_connection(&mut self) {
        let Some(link) = self.link.clone() else {
            return;
        };

        self.channel = None;
        if let Some(connection) = self.connection.take() {
            if let Err(err) = connection.close(REPLY_SUCCESS, SHUTDOWN_REASON).await {
                debug!(error = err.to_string(), "connection was already closed");
            }
        }
        link.connection_closed(REPLY_SUCCESS, SHUTDOWN_REASON);
    }

    fn channel(&self) -> Option<(Arc<dyn TransportChannel>, LinkEvents)> {
        match (&self.channel, &self.link) {
            (Some(channel), Some(link)) => Some((channel.clone(), link.clone())),
            _ => {
                warn!("no open channel");
                None
            }
        }
    }

    fn replace_timer(slot: &mut Option<JoinHandle<()>>, timer: JoinHandle<()>) {
        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
    }

    fn abort_timers(&mut self) {
        for timer in [self.reconnect_timer.take(), self.publish_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

/// Posts `PublishDue` after `interval`, stamped with the generation of the
/// connection it was scheduled on.
fn schedule_publish(link: LinkEvents, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(interval).await;
        link.post(LinkSignal::PublishDue);
    })
}

fn topology_failed(link: &LinkEvents, err: AmqpError) {
    link.post(LinkSignal::TopologyFailed {
        reason: err.to_string(),
    });
}

/// A failed channel RPC means the channel is unusable.
fn channel_failed(link: &LinkEvents, err: AmqpError) {
    link.channel_closed(0, &err.to_string());
}

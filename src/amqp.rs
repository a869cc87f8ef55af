// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! The production transport: implements the session's transport seam on top of
//! `lapin`. Broker-initiated activity is bridged into the session loop:
//! connection and channel errors become closure signals, publisher confirms are
//! awaited on a spawned task per message, and the consumer stream is drained by
//! a spawned task that forwards every delivery.

use crate::{
    errors::AmqpError,
    event::ConfirmOutcome,
    exchange::ExchangeDefinition,
    message::{Delivery, MessageProperties, Metadata},
    queue::{QueueBinding, QueueDefinition},
    transport::{LinkEvents, Transport, TransportChannel, TransportConnection},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Reply code reported for closures observed through a client error
const REPLY_UNKNOWN: u16 = 0;

/// Connects with `lapin`, naming the connection so it is recognizable in the
/// broker's management UI.
#[derive(Debug, Clone)]
pub struct LapinTransport {
    connection_name: String,
}

impl LapinTransport {
    /// Creates a transport whose connections are named `connection_name`.
    pub fn new(connection_name: &str) -> LapinTransport {
        LapinTransport {
            connection_name: connection_name.to_owned(),
        }
    }
}

impl Default for LapinTransport {
    fn default() -> Self {
        LapinTransport::new("asynq")
    }
}

#[async_trait]
impl Transport for LapinTransport {
    /// Opens a `lapin` connection and reports its errors as closures on
    /// `events`.
    async fn connect(
        &self,
        url: &str,
        events: LinkEvents,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(url, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;

        // lapin has no hook before the handshake, a closure in between shows up
        // as a failing create_channel instead.
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "connection error");
            events.connection_closed(REPLY_UNKNOWN, &err.to_string());
        });
        debug!("amqp connected");

        Ok(Arc::new(LapinConnection { conn }))
    }
}

/// An open `lapin` connection.
struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    /// Creates a channel and reports its errors as closures on `events`.
    async fn open_channel(
        &self,
        events: LinkEvents,
    ) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        let on_error = events.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "channel error");
            on_error.channel_closed(REPLY_UNKNOWN, &err.to_string());
        });
        debug!("channel created");

        Ok(Arc::new(LapinChannel { channel, events }))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError> {
        self.conn.close(code, reason).await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

/// An open `lapin` channel with the reporter of the connection it belongs to.
struct LapinChannel {
    channel: Channel,
    events: LinkEvents,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    /// Declares a non-durable exchange that is never auto-deleted.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: false,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Declares a non-durable, non-exclusive queue.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: false,
                    auto_delete: def.delete,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        match self
            .channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to bind queue to exchange");
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            }
            _ => Ok(()),
        }
    }

    async fn enable_publisher_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ConfirmSelectError
            })
    }

    /// Publishes one message.
    ///
    /// When the channel is in confirm mode a spawned task waits for the
    /// broker's ack or nack and reports it under `delivery_tag`.
    async fn publish(
        &self,
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        for (key, value) in &properties.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }

        let confirm = match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                BasicProperties::default()
                    .with_content_type(ShortString::from(properties.content_type.clone()))
                    .with_app_id(ShortString::from(properties.app_id.clone()))
                    .with_message_id(ShortString::from(properties.message_id.clone()))
                    .with_headers(FieldTable::from(headers)),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            Ok(c) => Ok(c),
        }?;

        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_ack() => {
                    events.confirmed(delivery_tag, ConfirmOutcome::Ack)
                }
                Ok(confirmation) if confirmation.is_nack() => {
                    events.confirmed(delivery_tag, ConfirmOutcome::Nack)
                }
                Ok(_) => {}
                Err(err) => debug!(
                    error = err.to_string(),
                    delivery_tag, "confirmation lost with the channel"
                ),
            }
        });

        Ok(())
    }

    /// Subscribes with manual acknowledgements and forwards every delivery
    /// from a spawned task.
    ///
    /// The stream ending on a channel that is still connected means the
    /// broker cancelled the consumer.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        let events = self.events.clone();
        let channel = self.channel.clone();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => events.delivered(from_lapin(delivery)),
                    Err(err) => {
                        // the channel error handler reports the closure
                        error!(error = err.to_string(), "errors consume msg");
                        return;
                    }
                }
            }

            if channel.status().connected() {
                events.consumer_cancelled();
            }
        });

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self, code: u16, reason: &str) -> Result<(), AmqpError> {
        self.channel.close(code, reason).await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}

/// Converts a `lapin` delivery into the broker-agnostic one handlers see.
fn from_lapin(delivery: lapin::message::Delivery) -> Delivery {
    let metadata = Metadata {
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        content_type: short_string(delivery.properties.content_type()),
        app_id: short_string(delivery.properties.app_id()),
        message_id: short_string(delivery.properties.message_id()),
        correlation_id: short_string(delivery.properties.correlation_id()),
        reply_to: short_string(delivery.properties.reply_to()),
        headers: string_headers(&delivery.properties),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        metadata,
        body: delivery.data,
    }
}

fn short_string(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|v| v.as_str().to_owned())
}

/// Extracts the string-valued headers of a message.
fn string_headers(props: &AMQPProperties) -> BTreeMap<String, String> {
    let Some(table) = props.headers() else {
        return BTreeMap::new();
    };

    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes()).ok()?.to_owned(),
                AMQPValue::ShortString(v) => v.as_str().to_owned(),
                _ => return None,
            };
            Some((key.as_str().to_owned(), value))
        })
        .collect()
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! The handler interface consumers deliver to, and the dispatch step that runs
//! a handler for one delivery inside an OpenTelemetry consumer span.
//!
//! Handlers see only the delivery tag, the [`Metadata`] of the message and its
//! body; nothing of the underlying broker client leaks through.

use crate::{
    message::{Delivery, Metadata},
    otel,
};
use async_trait::async_trait;
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error};

/// Span name used when a message carries no routing key.
const DEFAULT_SPAN_NAME: &str = "amqp consume";

/// Receives the messages of a consumer session.
///
/// The session has already acknowledged the message (when acknowledgement is
/// enabled) by the time `handle` runs, so the handler can't reject it. A
/// panicking handler is logged and the session moves on to the next message.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery_tag: u64, metadata: &Metadata, body: &[u8]);
}

/// Adapts a closure returning a future into a [`MessageHandler`].
///
/// The closure receives owned copies of the metadata and body so the returned
/// future can be `'static`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(f: F) -> FnHandler<F>
    where
        F: Fn(u64, Metadata, Vec<u8>) -> Fut,
    {
        FnHandler { f }
    }
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(u64, Metadata, Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, delivery_tag: u64, metadata: &Metadata, body: &[u8]) {
        (self.f)(delivery_tag, metadata.clone(), body.to_vec()).await
    }
}

/// Runs `handler` for one delivery, continuing the trace carried in the
/// message headers.
///
/// Returns `false` when the handler panicked. The panic is contained here so
/// it never unwinds through the session loop.
pub(crate) async fn dispatch(
    handler: &Arc<dyn MessageHandler>,
    tracer: &BoxedTracer,
    delivery: &Delivery,
) -> bool {
    let name = if delivery.metadata.routing_key.is_empty() {
        DEFAULT_SPAN_NAME
    } else {
        delivery.metadata.routing_key.as_str()
    };
    let (_ctx, mut span) = otel::new_span(&delivery.metadata.headers, tracer, name);

    debug!(
        "received: {} - exchange: {}",
        delivery.delivery_tag, delivery.metadata.exchange,
    );

    let outcome = AssertUnwindSafe(handler.handle(
        delivery.delivery_tag,
        &delivery.metadata,
        &delivery.body,
    ))
    .catch_unwind()
    .await;

    let completed = match outcome {
        Ok(()) => {
            span.set_status(Status::Ok);
            true
        }
        Err(_) => {
            error!(
                delivery_tag = delivery.delivery_tag,
                exchange = %delivery.metadata.exchange,
                "message handler panicked"
            );
            span.set_status(Status::error("message handler panicked"));
            false
        }
    };
    span.end();
    completed
}

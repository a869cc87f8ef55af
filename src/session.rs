// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Session
//!
//! The public entry point. A [`Session`] is created from a [`SessionConfig`]
//! and started in one of three ways:
//!
//! * [`Session::send_once`] publishes one message, waits for its
//!   confirmation and shuts down.
//! * [`Session::send_continuous`] publishes the same message at a fixed
//!   interval until stopped.
//! * [`Session::serve`] consumes the queue and hands every message to a
//!   [`MessageHandler`].
//!
//! Each start spawns the session's event loop on the current Tokio runtime and
//! returns a [`SessionTask`] to stop it and collect its [`SessionReport`].
//! Lost connections and channels are recovered in the background; the task
//! only completes once the session is stopped, its one-shot work is done, or
//! a fatal error ends it.

use crate::{
    amqp::LapinTransport,
    config::{Role, SessionConfig},
    dispatcher::MessageHandler,
    errors::AmqpError,
    event::Event,
    machine::{SessionReport, StateMachine},
    message::Payload,
    publisher::PublishMode,
    runtime::Runtime,
    transport::Transport,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    runtime::Handle,
    sync::{mpsc, oneshot},
};
use tracing::{debug, error, info};

pub struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// Creates a session talking to the broker with `lapin`.
    pub fn new(config: SessionConfig) -> Session {
        let transport = Arc::new(LapinTransport::new(&config.app_id));
        Session::with_transport(config, transport)
    }

    /// Creates a session on a custom transport.
    pub fn with_transport(config: SessionConfig, transport: Arc<dyn Transport>) -> Session {
        Session { config, transport }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Publishes `payload` once.
    ///
    /// With acknowledgements enabled the session stays up, reconnecting as
    /// needed, until the broker acks or nacks the message; otherwise it shuts
    /// down as soon as the message is handed over.
    pub fn send_once(&self, payload: impl Into<Payload>) -> Result<SessionTask, AmqpError> {
        self.check(Role::Publisher)?;
        let machine = StateMachine::publisher(&self.config, PublishMode::OneShot(payload.into()));
        self.spawn(machine, None)
    }

    /// Publishes `payload` every `interval` until stopped.
    pub fn send_continuous(
        &self,
        payload: impl Into<Payload>,
        interval: Duration,
    ) -> Result<SessionTask, AmqpError> {
        self.check(Role::Publisher)?;
        if interval.is_zero() {
            return Err(AmqpError::InvalidConfig(
                "publish interval must be greater than zero".to_owned(),
            ));
        }

        let machine = StateMachine::publisher(
            &self.config,
            PublishMode::Continuous {
                payload: payload.into(),
                interval,
            },
        );
        self.spawn(machine, None)
    }

    /// Consumes the session's queue, handing every message to `handler`.
    ///
    /// A missing handler is refused before anything is sent to the broker.
    pub fn serve(
        &self,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<SessionTask, AmqpError> {
        let Some(handler) = handler else {
            error!("a consumer needs a message handler, not subscribing");
            return Err(AmqpError::MissingHandler);
        };

        self.check(Role::Consumer)?;
        let machine = StateMachine::consumer(&self.config);
        self.spawn(machine, Some(handler))
    }

    fn check(&self, requested: Role) -> Result<(), AmqpError> {
        if self.config.role != requested {
            error!(
                configured = %self.config.role,
                requested = %requested,
                "session role mismatch"
            );
            return Err(AmqpError::RoleMismatch {
                configured: self.config.role.to_string(),
                requested: requested.to_string(),
            });
        }

        self.config.validate()
    }

    fn spawn(
        &self,
        machine: StateMachine,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<SessionTask, AmqpError> {
        let runtime = match Handle::try_current() {
            Ok(h) => Ok(h),
            Err(err) => {
                error!(error = err.to_string(), "sessions must be started inside a tokio runtime");
                Err(AmqpError::InternalError)
            }
        }?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();
        let session = Runtime::new(self.transport.clone(), handler, tx.clone(), rx);

        info!(
            role = %self.config.role,
            exchange = %self.config.exchange,
            queue = %self.config.queue_name(),
            "starting session"
        );

        runtime.spawn(async move {
            let outcome = session.run(machine).await;
            if done_tx.send(outcome).is_err() {
                debug!("nobody is waiting for the session outcome");
            }
        });

        Ok(SessionTask {
            handle: SessionHandle { tx },
            done: done_rx,
        })
    }
}

/// Requests the shutdown of a running session. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl SessionHandle {
    /// Asks the session to stop. The session cancels its consumer, closes the
    /// channel and the connection, and then completes; stopping a finished
    /// session does nothing.
    pub fn stop(&self) {
        if self.tx.send(Event::StopRequested).is_err() {
            debug!("session already finished");
        }
    }
}

/// A running session.
#[derive(Debug)]
pub struct SessionTask {
    handle: SessionHandle,
    done: oneshot::Receiver<Result<SessionReport, AmqpError>>,
}

impl SessionTask {
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop()
    }

    /// Waits for the session to finish.
    pub async fn wait(self) -> Result<SessionReport, AmqpError> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("session task ended without an outcome");
                Err(AmqpError::InternalError)
            }
        }
    }

    /// Blocks the calling thread until the session finishes.
    ///
    /// Must not be called from within an asynchronous execution context.
    pub fn blocking_wait(self) -> Result<SessionReport, AmqpError> {
        match self.done.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => {
                error!("session task ended without an outcome");
                Err(AmqpError::InternalError)
            }
        }
    }
}

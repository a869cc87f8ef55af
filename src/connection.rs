// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Supervision
//!
//! Owns the lifecycle of the single logical broker connection of a session:
//! connecting, classifying closures as expected or not, and reconnecting after
//! a fixed delay for as long as the session has not been stopped.
//!
//! ```text
//! Disconnected -> Connecting -> Open -> Closing -> Closed
//!      ^              |          |         |
//!      +--------------+----------+---------+  (unexpected closure, retry)
//! ```

use crate::event::{Command, Generation};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// How a connection closure was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Closure {
    /// The session asked for it; nothing is retried.
    Expected,
    /// Link loss; a reconnect has been scheduled.
    Unexpected,
}

/// State machine for the session's connection.
///
/// Every connect attempt allocates a new [`Generation`]; the previous
/// connection is never reused. At most one reconnect timer is outstanding.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    url: String,
    reconnect_delay: Duration,
    state: ConnectionState,
    generation: Generation,
    reconnect_pending: bool,
    closing: bool,
    reconnects: u64,
}

impl ConnectionSupervisor {
    pub fn new(url: &str, reconnect_delay: Duration) -> ConnectionSupervisor {
        ConnectionSupervisor {
            url: url.to_owned(),
            reconnect_delay,
            state: ConnectionState::Disconnected,
            generation: Generation::default(),
            reconnect_pending: false,
            closing: false,
            reconnects: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Begins the first connect attempt.
    pub fn start(&mut self, out: &mut Vec<Command>) {
        if self.state != ConnectionState::Disconnected || self.reconnect_pending || self.closing {
            warn!(state = ?self.state, "connection already started");
            return;
        }

        self.connect(out);
    }

    fn connect(&mut self, out: &mut Vec<Command>) {
        self.generation = self.generation.next();
        self.state = ConnectionState::Connecting;

        info!(url = %self.url, generation = %self.generation, "connecting");
        out.push(Command::Connect {
            generation: self.generation,
            url: self.url.clone(),
        });
    }

    /// Records that the pending connect attempt succeeded.
    pub fn on_open(&mut self) -> bool {
        if self.state != ConnectionState::Connecting {
            warn!(state = ?self.state, "unexpected connection open notification");
            return false;
        }

        info!(generation = %self.generation, "connection opened");
        self.state = ConnectionState::Open;
        true
    }

    /// Asks for the open connection to be closed.
    ///
    /// Whether the resulting closure counts as expected depends only on
    /// whether [`ConnectionSupervisor::stop`] was called before it arrives.
    pub fn close(&mut self, out: &mut Vec<Command>) {
        match self.state {
            ConnectionState::Open => {
                info!("closing connection");
                self.state = ConnectionState::Closing;
                out.push(Command::CloseConnection);
            }
            state => debug!(state = ?state, "no open connection to close"),
        }
    }

    /// Marks the session as shutting down.
    ///
    /// Returns `true` when there is no connection left to unwind, which is the
    /// case while waiting for a reconnect (the timer is cancelled) or when
    /// already closed.
    pub fn stop(&mut self, out: &mut Vec<Command>) -> bool {
        self.closing = true;

        match self.state {
            ConnectionState::Disconnected => {
                if self.reconnect_pending {
                    debug!("cancelling pending reconnect");
                    self.reconnect_pending = false;
                    out.push(Command::CancelReconnect);
                }
                self.state = ConnectionState::Closed;
                true
            }
            ConnectionState::Closed => true,
            _ => false,
        }
    }

    /// Handles the end of the current connection, or the failure of the
    /// attempt to establish it.
    ///
    /// Returns `None` for closures that don't belong to a live connection.
    pub fn on_closed(&mut self, code: u16, reason: &str, out: &mut Vec<Command>) -> Option<Closure> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Open | ConnectionState::Closing => {}
            state => {
                debug!(state = ?state, code, reason, "ignoring closure of a dead connection");
                return None;
            }
        }

        if self.closing {
            info!(code, reason, "connection closed");
            self.state = ConnectionState::Closed;
            return Some(Closure::Expected);
        }

        warn!(
            code,
            reason,
            delay = ?self.reconnect_delay,
            "connection closed unexpectedly, reconnecting"
        );
        self.state = ConnectionState::Disconnected;
        self.reconnect_pending = true;
        out.push(Command::ScheduleReconnect(self.reconnect_delay));

        Some(Closure::Unexpected)
    }

    /// Fires the pending reconnect.
    pub fn on_reconnect_due(&mut self, out: &mut Vec<Command>) {
        if !self.reconnect_pending || self.closing || self.state != ConnectionState::Disconnected {
            debug!(state = ?self.state, "no reconnect pending");
            return;
        }

        self.reconnect_pending = false;
        self.reconnects += 1;
        self.connect(out);
    }
}

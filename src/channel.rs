// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Supervision
//!
//! Tracks the one channel a session keeps on its open connection. A channel is
//! only ever opened on a freshly opened connection and is forgotten whenever
//! that connection goes away: channel numbers and everything declared through
//! a channel belong to the connection, so a lost channel is recovered by
//! cycling the whole connection.

use crate::event::Command;
use tracing::{debug, info, warn};

/// Lifecycle of the session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel on the current connection.
    None,
    /// `channel.open` sent, waiting for `open-ok`.
    Opening,
    /// The channel is usable.
    Open,
    /// The channel closed; it is never reopened on the same connection.
    Closed,
}

/// How a channel closure should be treated by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelClosure {
    /// No live channel; the notification is stale.
    Ignored,
    /// Part of a shutdown the session asked for.
    Expected,
    /// The channel died under a running session; the connection has to be
    /// recycled.
    Abnormal,
}

/// Supervises the single channel of a session.
#[derive(Debug)]
pub struct ChannelSupervisor {
    state: ChannelState,
    close_requested: bool,
}

impl Default for ChannelSupervisor {
    fn default() -> Self {
        ChannelSupervisor::new()
    }
}

impl ChannelSupervisor {
    /// Creates a supervisor with no channel.
    pub fn new() -> ChannelSupervisor {
        ChannelSupervisor {
            state: ChannelState::None,
            close_requested: false,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Whether the channel is open and no close was requested on it.
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open && !self.close_requested
    }

    /// Requests a new channel on the freshly opened connection.
    pub fn open(&mut self, out: &mut Vec<Command>) {
        match self.state {
            ChannelState::None | ChannelState::Closed => {
                info!("creating channel");
                self.state = ChannelState::Opening;
                self.close_requested = false;
                out.push(Command::OpenChannel);
            }
            state => warn!(state = ?state, "channel already requested"),
        }
    }

    /// The broker opened the channel.
    ///
    /// Returns `true` when the notification matches an open request, after
    /// which topology can be installed.
    pub fn on_open(&mut self) -> bool {
        if self.state != ChannelState::Opening {
            warn!(state = ?self.state, "unexpected channel open notification");
            return false;
        }

        info!("channel opened");
        self.state = ChannelState::Open;
        true
    }

    /// Requests a graceful close of the open channel. Does nothing when there
    /// is no open channel or a close is already on its way.
    pub fn close(&mut self, out: &mut Vec<Command>) {
        if self.state != ChannelState::Open || self.close_requested {
            debug!(state = ?self.state, "no open channel to close");
            return;
        }

        info!("closing the channel");
        self.close_requested = true;
        out.push(Command::CloseChannel);
    }

    /// The channel closed with the given reply `code` and `reason`.
    ///
    /// # Arguments
    ///
    /// * `code` - The AMQP reply code, `0` when only a client error was seen
    /// * `reason` - The reply text
    /// * `stopping` - Whether the session is shutting down
    ///
    /// # Returns
    ///
    /// How the session has to react, see [`ChannelClosure`].
    pub fn on_closed(&mut self, code: u16, reason: &str, stopping: bool) -> ChannelClosure {
        match self.state {
            ChannelState::Opening | ChannelState::Open => {}
            state => {
                debug!(state = ?state, code, reason, "ignoring closure of a dead channel");
                return ChannelClosure::Ignored;
            }
        }

        self.state = ChannelState::Closed;

        if stopping {
            info!(code, reason, "channel closed");
            ChannelClosure::Expected
        } else {
            warn!(code, reason, "channel closed unexpectedly");
            ChannelClosure::Abnormal
        }
    }

    /// Forgets the channel of a connection that went away.
    pub fn reset(&mut self) {
        if self.state != ChannelState::None {
            debug!(state = ?self.state, "discarding channel of the closed connection");
        }
        self.state = ChannelState::None;
        self.close_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opened() -> ChannelSupervisor {
        let mut sup = ChannelSupervisor::new();
        let mut out = vec![];
        sup.open(&mut out);
        assert_eq!(out, vec![Command::OpenChannel]);
        assert!(sup.on_open());
        sup
    }

    #[test]
    fn unexpected_closure_is_abnormal() {
        let mut sup = opened();
        assert_eq!(sup.on_closed(406, "PRECONDITION_FAILED", false), ChannelClosure::Abnormal);
        assert_eq!(sup.state(), ChannelState::Closed);
    }

    #[test]
    fn closure_while_stopping_is_expected() {
        let mut sup = opened();
        let mut out = vec![];
        sup.close(&mut out);
        sup.close(&mut out);
        assert_eq!(out, vec![Command::CloseChannel]);
        assert!(!sup.is_open());
        assert_eq!(sup.on_closed(200, "normal shutdown", true), ChannelClosure::Expected);
    }

    #[test]
    fn duplicate_and_stale_closures_are_ignored() {
        let mut sup = opened();
        sup.on_closed(504, "channel error", false);
        assert_eq!(sup.on_closed(504, "channel error", false), ChannelClosure::Ignored);

        sup.reset();
        assert_eq!(sup.state(), ChannelState::None);
        assert_eq!(sup.on_closed(504, "channel error", false), ChannelClosure::Ignored);
    }

    #[test]
    fn a_reset_channel_can_be_reopened() {
        let mut sup = opened();
        sup.reset();

        let mut out = vec![];
        sup.open(&mut out);
        assert_eq!(out, vec![Command::OpenChannel]);
        assert_eq!(sup.state(), ChannelState::Opening);

        let mut out = vec![];
        sup.open(&mut out);
        assert!(out.is_empty());
    }
}

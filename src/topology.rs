// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Installation
//!
//! Declares the exchange, declares the queue and binds them, one step at a
//! time, each step only after the broker confirmed the previous one. A
//! publisher that wants delivery confirmations additionally switches the
//! channel into confirm mode once the binding exists, before any message is
//! sent. The sequence runs once per channel lifetime.
//!
//! Declares are plain (non-passive) declarations, so running the sequence
//! again against topology that already exists with the same parameters is a
//! no-op on the broker.

use crate::{
    event::Command,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use tracing::{debug, error, info, warn};

/// Progress of the installation on the current channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStep {
    /// Nothing requested yet on this channel.
    Idle,
    /// `exchange.declare` sent, waiting for `declare-ok`.
    DeclaringExchange,
    /// `queue.declare` sent, waiting for `declare-ok`.
    DeclaringQueue,
    /// `queue.bind` sent, waiting for `bind-ok`.
    Binding,
    /// `confirm.select` sent, waiting for `select-ok`.
    EnablingConfirms,
    /// Every step completed; the channel is ready for traffic.
    Installed,
}

/// Installs the exchange, queue and binding of a session on its channel.
///
/// The installer only decides which declaration comes next; it emits one
/// [`Command`] per step and waits for the matching completion before moving on.
/// Completions arriving for a step other than the current one are logged and
/// ignored.
#[derive(Debug)]
pub struct TopologyInstaller {
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding: QueueBinding,
    confirms: bool,
    step: TopologyStep,
}

impl TopologyInstaller {
    /// Creates an installer for the given definitions.
    ///
    /// # Arguments
    ///
    /// * `exchange` - The exchange declared first
    /// * `queue` - The queue declared once the exchange exists
    /// * `binding` - The binding created once both exist
    /// * `confirms` - Whether to put the channel in confirm mode as the last
    ///   step
    pub fn new(
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        binding: QueueBinding,
        confirms: bool,
    ) -> TopologyInstaller {
        TopologyInstaller {
            exchange,
            queue,
            binding,
            confirms,
            step: TopologyStep::Idle,
        }
    }

    /// The step the installation is waiting on.
    pub fn step(&self) -> TopologyStep {
        self.step
    }

    /// Whether every step completed on the current channel.
    pub fn is_installed(&self) -> bool {
        self.step == TopologyStep::Installed
    }

    /// Starts the installation on a freshly opened channel by declaring the
    /// exchange.
    pub fn install(&mut self, out: &mut Vec<Command>) {
        debug!(
            exchange = self.exchange.name(),
            kind = %self.exchange.exchange_kind(),
            "declaring exchange"
        );
        self.step = TopologyStep::DeclaringExchange;
        out.push(Command::DeclareExchange(self.exchange.clone()));
    }

    /// The broker declared the exchange; declares the queue next.
    pub fn on_exchange_declared(&mut self, out: &mut Vec<Command>) {
        if !self.expect(TopologyStep::DeclaringExchange) {
            return;
        }

        debug!(
            queue = self.queue.name(),
            auto_delete = self.queue.is_auto_delete(),
            "exchange declared, declaring queue"
        );
        self.step = TopologyStep::DeclaringQueue;
        out.push(Command::DeclareQueue(self.queue.clone()));
    }

    /// The broker declared the queue; binds it to the exchange next.
    pub fn on_queue_declared(&mut self, out: &mut Vec<Command>) {
        if !self.expect(TopologyStep::DeclaringQueue) {
            return;
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.binding.queue_name(),
            self.binding.exchange_name(),
            self.binding.key()
        );
        self.step = TopologyStep::Binding;
        out.push(Command::BindQueue(self.binding.clone()));
    }

    /// The broker bound the queue.
    ///
    /// Returns `true` when this completes the installation, that is when no
    /// confirm mode was requested. Otherwise `confirm.select` is issued.
    pub fn on_bound(&mut self, out: &mut Vec<Command>) -> bool {
        if !self.expect(TopologyStep::Binding) {
            return false;
        }

        if self.confirms {
            debug!("queue bound, issuing confirm.select");
            self.step = TopologyStep::EnablingConfirms;
            out.push(Command::EnableConfirms);
            return false;
        }

        self.installed()
    }

    /// The channel entered confirm mode. Returns `true` when this completes
    /// the installation.
    pub fn on_confirms_enabled(&mut self) -> bool {
        if !self.expect(TopologyStep::EnablingConfirms) {
            return false;
        }

        self.installed()
    }

    /// The broker rejected the current step. The channel is unusable after a
    /// rejection, so progress starts over on the next one.
    pub fn on_failed(&mut self, reason: &str) {
        error!(step = ?self.step, reason, "broker rejected the topology");
        self.step = TopologyStep::Idle;
    }

    /// Forgets progress made on a channel that is gone.
    pub fn reset(&mut self) {
        self.step = TopologyStep::Idle;
    }

    fn installed(&mut self) -> bool {
        info!(queue = self.queue.name(), "topology installed");
        self.step = TopologyStep::Installed;
        true
    }

    fn expect(&self, step: TopologyStep) -> bool {
        if self.step != step {
            warn!(expected = ?step, actual = ?self.step, "out of order topology completion");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    fn installer(confirms: bool) -> TopologyInstaller {
        TopologyInstaller::new(
            ExchangeDefinition::new("yacamc").kind(ExchangeKind::Topic),
            QueueDefinition::new("jobs").delete(),
            QueueBinding::new("jobs").exchange("yacamc").routing_key("jobs.*"),
            confirms,
        )
    }

    fn run(installer: &mut TopologyInstaller) -> Vec<Command> {
        let mut out = vec![];
        installer.install(&mut out);
        installer.on_exchange_declared(&mut out);
        installer.on_queue_declared(&mut out);
        if installer.on_bound(&mut out) {
            return out;
        }
        assert!(installer.on_confirms_enabled());
        out
    }

    #[test]
    fn declares_in_strict_order_then_enables_confirms() {
        let mut inst = installer(true);
        let out = run(&mut inst);

        assert_eq!(
            out,
            vec![
                Command::DeclareExchange(ExchangeDefinition::new("yacamc").kind(ExchangeKind::Topic)),
                Command::DeclareQueue(QueueDefinition::new("jobs").delete()),
                Command::BindQueue(
                    QueueBinding::new("jobs").exchange("yacamc").routing_key("jobs.*")
                ),
                Command::EnableConfirms,
            ]
        );
        assert!(inst.is_installed());
    }

    #[test]
    fn skips_confirm_mode_when_not_requested() {
        let mut inst = installer(false);
        let out = run(&mut inst);
        assert_eq!(out.len(), 3);
        assert!(!out.contains(&Command::EnableConfirms));
        assert!(inst.is_installed());
    }

    #[test]
    fn reinstalling_issues_the_same_sequence() {
        let mut inst = installer(true);
        let first = run(&mut inst);
        inst.reset();
        let second = run(&mut inst);
        assert_eq!(first, second);
        assert!(inst.is_installed());
    }

    #[test]
    fn out_of_order_completions_are_ignored() {
        let mut inst = installer(false);
        let mut out = vec![];
        inst.install(&mut out);

        assert!(!inst.on_bound(&mut out));
        inst.on_queue_declared(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(inst.step(), TopologyStep::DeclaringExchange);
    }

    #[test]
    fn failure_resets_progress() {
        let mut inst = installer(false);
        let mut out = vec![];
        inst.install(&mut out);
        inst.on_failed("inequivalent arg 'type' for exchange");
        assert_eq!(inst.step(), TopologyStep::Idle);
        inst.on_exchange_declared(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(inst.step(), TopologyStep::Idle);
    }
}

//! Routing of the controller interrupt line to transfer callbacks

use canloop_core::{Controller, InterruptHandler};

use super::{ErrorSet, InterruptSet};
use crate::fmt::trace;
use crate::transfer::TransferCallbacks;

/// Interrupt handler that demultiplexes the interrupt status of one
/// controller onto a set of [`TransferCallbacks`].
///
/// Flagged interrupts are acknowledged before any callback runs, so a
/// condition raised again while callbacks execute fires a fresh interrupt.
pub struct Dispatcher<'a, C, H> {
    can: &'a C,
    callbacks: &'a H,
}

impl<'a, C: Controller, H: TransferCallbacks<C>> Dispatcher<'a, C, H> {
    /// Create a dispatcher for `can`
    pub fn new(can: &'a C, callbacks: &'a H) -> Self {
        Self { can, callbacks }
    }

    /// Service the flagged interrupts and return the set that was handled.
    pub fn dispatch(&self) -> InterruptSet {
        let pending =
            InterruptSet::from(self.can.interrupt_status()).intersection(InterruptSet::ALL);
        if pending.is_empty() {
            return pending;
        }
        trace!("interrupt: {}", pending);
        self.can.clear_interrupts(pending.bits());

        if pending.error() {
            let errors = ErrorSet::from_status(self.can.error_status(), pending);
            self.callbacks.on_error(self.can, errors);
        }
        let events = pending.intersection(InterruptSet::EVENTS);
        if !events.is_empty() {
            self.callbacks.on_event(self.can, events);
        }
        if pending.txok() {
            self.callbacks.on_send_complete(self.can);
        }
        if pending.rxok() || pending.rxnemp() {
            self.callbacks.on_receive(self.can);
        }
        pending
    }
}

impl<'a, C, H> InterruptHandler for Dispatcher<'a, C, H>
where
    C: Controller,
    H: TransferCallbacks<C> + Sync,
{
    fn handle(&self) {
        self.dispatch();
    }
}

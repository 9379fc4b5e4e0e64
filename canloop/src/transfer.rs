//! Completion tracking of a loopback transfer
//!
//! The [`Coordinator`] is the only channel between interrupt context and the
//! main thread of control. Each direction of the transfer has an atomic
//! [`Outcome`] that callbacks move out of [`Outcome::Pending`]; the main
//! thread spins until both directions have settled and only then reads the
//! received frame.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use bitfield::bitfield;
use canloop_core::Controller;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::fmt::{debug, error, info, warning};
use crate::interrupt::{ErrorSet, InterruptSet};
use crate::message::Frame;

/// Why a direction of the transfer failed
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FailReason {
    /// The received frame could not be read or decoded
    ReceiveError,
    /// The controller flagged protocol errors
    BusError(ErrorSet),
    /// The controller went bus-off
    BusOff,
}

/// State of one direction of the transfer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Outcome {
    /// Nothing reported yet
    Pending,
    /// Completed successfully
    Done,
    /// Completed with an error
    Failed(FailReason),
}

impl Outcome {
    /// `true` once the direction has left [`Outcome::Pending`]
    pub fn is_settled(&self) -> bool {
        !matches!(self, Outcome::Pending)
    }
}

/// Direction of the transfer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Frame leaving the controller
    Send,
    /// Frame arriving at the controller
    Receive,
}

const PENDING: u8 = 0;
const DONE: u8 = 1;
const FAILED: u8 = 2;

const RECEIVE_ERROR: u8 = 0;
const BUS_ERROR: u8 = 1;
const BUS_OFF: u8 = 2;

bitfield! {
    /// Packed [`Outcome`], stored in an atomic
    #[derive(Copy, Clone)]
    struct OutcomeWord(u32);
    u8, state, set_state: 1, 0;
    u8, reason, set_reason: 5, 4;
    u8, errors, set_errors: 14, 8;
}

impl From<Outcome> for OutcomeWord {
    fn from(outcome: Outcome) -> Self {
        let mut word = OutcomeWord(0);
        match outcome {
            Outcome::Pending => word.set_state(PENDING),
            Outcome::Done => word.set_state(DONE),
            Outcome::Failed(reason) => {
                word.set_state(FAILED);
                match reason {
                    FailReason::ReceiveError => word.set_reason(RECEIVE_ERROR),
                    FailReason::BusError(errors) => {
                        word.set_reason(BUS_ERROR);
                        word.set_errors(errors.bits());
                    }
                    FailReason::BusOff => word.set_reason(BUS_OFF),
                }
            }
        }
        word
    }
}

impl From<OutcomeWord> for Outcome {
    fn from(word: OutcomeWord) -> Self {
        match (word.state(), word.reason()) {
            (PENDING, _) => Outcome::Pending,
            (DONE, _) => Outcome::Done,
            (_, BUS_ERROR) => Outcome::Failed(FailReason::BusError(ErrorSet::from_bits(
                word.errors(),
            ))),
            (_, BUS_OFF) => Outcome::Failed(FailReason::BusOff),
            _ => Outcome::Failed(FailReason::ReceiveError),
        }
    }
}

/// Combine an existing outcome with a newly reported failure.
///
/// A failure overrides pending and completed outcomes. Bus errors reported
/// after a bus error accumulate; any other combination keeps the first
/// failure.
fn merge_failure(current: Outcome, reason: FailReason) -> Outcome {
    match (current, reason) {
        (Outcome::Failed(FailReason::BusError(a)), FailReason::BusError(b)) => {
            Outcome::Failed(FailReason::BusError(a.union(b)))
        }
        (Outcome::Failed(first), _) => Outcome::Failed(first),
        _ => Outcome::Failed(reason),
    }
}

/// Bounded wait ran out before both directions settled
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct WaitTimeout {
    /// Outcome of the send direction when the wait gave up
    pub send: Outcome,
    /// Outcome of the receive direction when the wait gave up
    pub receive: Outcome,
}

/// Operations invoked from interrupt context.
///
/// Implementations are installed once through an interrupt dispatcher and
/// never called directly by the main thread of control.
pub trait TransferCallbacks<C: Controller> {
    /// The controller finished transmitting a frame.
    fn on_send_complete(&self, can: &C);

    /// A frame is waiting in the receive FIFO.
    fn on_receive(&self, can: &C);

    /// The controller flagged `errors`. Implementations must clear the latched
    /// error status, otherwise the controller keeps signalling it.
    fn on_error(&self, can: &C, errors: ErrorSet);

    /// Asynchronous controller events such as bus-off or sleep.
    fn on_event(&self, can: &C, events: InterruptSet);
}

/// Shared state of a single in-flight transfer
pub struct Coordinator<M: RawMutex> {
    send: AtomicU32,
    receive: AtomicU32,
    received: Mutex<M, Cell<Option<Frame>>>,
}

impl<M: RawMutex> Default for Coordinator<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> Coordinator<M> {
    /// Create a coordinator with both directions pending
    pub const fn new() -> Self {
        Self {
            send: AtomicU32::new(PENDING as u32),
            receive: AtomicU32::new(PENDING as u32),
            received: Mutex::new(Cell::new(None)),
        }
    }

    fn slot(&self, direction: Direction) -> &AtomicU32 {
        match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        }
    }

    /// Set both directions to [`Outcome::Pending`] and drop any frame kept
    /// from an earlier transfer. Call before each send attempt.
    pub fn reset_outcomes(&self) {
        self.received.lock(|frame| frame.set(None));
        let pending = OutcomeWord::from(Outcome::Pending).0;
        self.send.store(pending, Ordering::Release);
        self.receive.store(pending, Ordering::Release);
    }

    /// Current outcome of `direction`
    pub fn outcome(&self, direction: Direction) -> Outcome {
        OutcomeWord(self.slot(direction).load(Ordering::Acquire)).into()
    }

    /// Frame decoded by the receive callback, if any
    pub fn received_frame(&self) -> Option<Frame> {
        self.received.lock(|frame| frame.get())
    }

    /// Spin until both directions have left [`Outcome::Pending`].
    ///
    /// There is no timeout; see [`Self::wait_for_both_within`] for a bounded
    /// variant.
    pub fn wait_for_both(&self) -> (Outcome, Outcome) {
        loop {
            if let Some(outcomes) = self.settled() {
                return outcomes;
            }
            core::hint::spin_loop();
        }
    }

    /// Like [`Self::wait_for_both`], giving up after `spins` polls.
    pub fn wait_for_both_within(&self, spins: u32) -> Result<(Outcome, Outcome), WaitTimeout> {
        for _ in 0..spins {
            if let Some(outcomes) = self.settled() {
                return Ok(outcomes);
            }
            core::hint::spin_loop();
        }
        self.settled().ok_or_else(|| WaitTimeout {
            send: self.outcome(Direction::Send),
            receive: self.outcome(Direction::Receive),
        })
    }

    fn settled(&self) -> Option<(Outcome, Outcome)> {
        let send = self.outcome(Direction::Send);
        let receive = self.outcome(Direction::Receive);
        (send.is_settled() && receive.is_settled()).then_some((send, receive))
    }

    /// Mark `direction` done unless it already settled.
    fn mark_done(&self, direction: Direction) {
        let _ = self.slot(direction).compare_exchange(
            OutcomeWord::from(Outcome::Pending).0,
            OutcomeWord::from(Outcome::Done).0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn mark_failed(&self, direction: Direction, reason: FailReason) {
        let _ = self
            .slot(direction)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let current = Outcome::from(OutcomeWord(word));
                Some(OutcomeWord::from(merge_failure(current, reason)).0)
            });
    }

    fn fail_both(&self, reason: FailReason) {
        self.mark_failed(Direction::Send, reason);
        self.mark_failed(Direction::Receive, reason);
    }
}

impl<C: Controller, M: RawMutex> TransferCallbacks<C> for Coordinator<M> {
    fn on_send_complete(&self, _can: &C) {
        debug!("frame sent");
        self.mark_done(Direction::Send);
    }

    fn on_receive(&self, can: &C) {
        let raw = match can.recv() {
            Ok(raw) => raw,
            Err(_) => {
                error!("failed to read the receive FIFO");
                self.mark_failed(Direction::Receive, FailReason::ReceiveError);
                return;
            }
        };
        match Frame::decode(&raw) {
            Ok(frame) => {
                debug!("frame received: {}", frame);
                // Published before the outcome so that a reader observing
                // `Done` finds the frame.
                self.received.lock(|slot| slot.set(Some(frame)));
                self.mark_done(Direction::Receive);
            }
            Err(e) => {
                error!("received an undecodable frame: {}", e);
                self.mark_failed(Direction::Receive, FailReason::ReceiveError);
            }
        }
    }

    fn on_error(&self, can: &C, errors: ErrorSet) {
        for name in errors.names() {
            error!("bus error: {}", name);
        }
        self.fail_both(FailReason::BusError(errors));
        can.clear_error_status(u32::from(errors.bits()) & ErrorSet::STATUS_MASK);
    }

    fn on_event(&self, _can: &C, events: InterruptSet) {
        if events.bsoff() {
            error!("controller entered bus-off");
            self.fail_both(FailReason::BusOff);
        }
        if events.rxoflw() {
            warning!("receive FIFO overflow");
        }
        if events.rxuflw() {
            warning!("receive FIFO underflow");
        }
        if events.txfll() || events.txbfll() {
            info!("transmit FIFO full");
        }
        if events.wkup() {
            info!("controller woke up");
        }
        if events.slp() {
            info!("controller entered sleep mode");
        }
        if events.arblst() {
            warning!("arbitration lost");
        }
    }
}

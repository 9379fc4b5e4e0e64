#![no_std]
#![warn(missing_docs)]

//! `canloop-core` provides the essential abstractions that serve as a thin
//! integration layer between the platform independent [`canloop`] crate and
//! platform specific HAL crates (in documentation also referred to as _target
//! HALs_).
//!
//! Traits from this crate are not supposed to be implemented by the
//! application developer; implementations should be provided by target HALs
//! (or by test doubles).
//!
//! There are two collaborators:
//! - [`Controller`]: access to a single CAN controller instance,
//! - [`InterruptBridge`]: the platform interrupt controller that routes the
//!   CAN interrupt line to a registered [`InterruptHandler`].
//!
//! [`canloop`]: <https://docs.rs/crate/canloop/>

pub use fugit;

/// Number of 32-bit words a frame occupies in the controller FIFOs.
///
/// Word 0 holds the identifier, word 1 the data length code and words 2 and 3
/// the payload.
pub const FRAME_WORDS: usize = 4;

/// A frame in the representation the controller FIFOs use.
pub type RawFrame = [u32; FRAME_WORDS];

/// Operating mode of a CAN controller
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    /// Controller is held in reset
    Reset,
    /// Configuration registers are writable, bus is inactive
    Configuration,
    /// Regular bus operation
    Normal,
    /// Transmitted frames are internally routed back to the receiver
    Loopback,
    /// Low power mode, woken up by bus activity
    Sleep,
}

impl Mode {
    /// `true` if frames may be sent and received in this mode.
    pub fn is_operational(self) -> bool {
        matches!(self, Mode::Normal | Mode::Loopback)
    }
}

/// Trait representing access to a CAN controller instance.
///
/// All methods take `&self`: the hardware registers are shared between the
/// main thread of control and the interrupt handler, so implementations are
/// expected to use interior mutability (volatile register access on real
/// hardware). The [`Sync`] bound allows the same reference to be reached from
/// interrupt context.
///
/// Values passed to [`Controller::set_baud_prescaler`] and
/// [`Controller::set_bit_timing`] are already in register encoding (the
/// hardware adds one to each field); the driver performs the conversion.
///
/// Bit masks exchanged through this trait are in the layout of the
/// controller's interrupt status and error status registers. `canloop`
/// interprets them.
pub trait Controller: Sync {
    /// Error reported by the target HAL
    type Error: core::fmt::Debug;

    /// Look up the controller described by `device_id` and bring it into its
    /// reset state.
    fn initialize(&self, device_id: u16) -> Result<(), Self::Error>;

    /// Run the built-in diagnostic of the controller. The controller is left
    /// in configuration mode afterwards.
    fn self_test(&self) -> Result<(), Self::Error>;

    /// Request a mode transition. The transition is asynchronous; completion
    /// is observed through [`Controller::mode`].
    fn enter_mode(&self, mode: Mode);

    /// Mode the controller currently reports.
    fn mode(&self) -> Mode;

    /// Write the baud rate prescaler register.
    fn set_baud_prescaler(&self, value: u8);

    /// Write the bit timing register.
    fn set_bit_timing(&self, sjw: u8, ts1: u8, ts2: u8);

    /// `true` while the transmit FIFO cannot accept another frame.
    fn is_tx_fifo_full(&self) -> bool;

    /// Write a frame into the transmit FIFO.
    fn send(&self, frame: &RawFrame) -> Result<(), Self::Error>;

    /// Read the oldest frame from the receive FIFO.
    fn recv(&self) -> Result<RawFrame, Self::Error>;

    /// Enable the interrupt sources in `mask`.
    fn enable_interrupts(&self, mask: u32);

    /// Currently flagged interrupts.
    fn interrupt_status(&self) -> u32;

    /// Acknowledge the interrupts in `mask`.
    fn clear_interrupts(&self, mask: u32);

    /// Latched error status.
    fn error_status(&self) -> u32;

    /// Clear the latched error flags in `mask`.
    fn clear_error_status(&self, mask: u32);

    /// Frequency of the clock feeding the CAN controller.
    fn can_clock(&self) -> fugit::HertzU32;
}

/// Entry point invoked by the platform when an interrupt line fires.
///
/// The [`InterruptBridge`] guarantees at most one concurrent invocation of a
/// registered handler; distinct handlers are not serialized against each
/// other.
pub trait InterruptHandler: Sync {
    /// Service the interrupt.
    fn handle(&self);
}

/// Trait representing the platform interrupt controller.
///
/// The lifetime `'a` bounds how long registered handlers have to live. On real
/// hardware this is usually `'static`.
pub trait InterruptBridge<'a> {
    /// Error reported by the interrupt controller
    type Error: core::fmt::Debug;

    /// Route interrupt line `source` to `handler`, replacing any handler that
    /// was registered before.
    fn register(
        &mut self,
        source: u16,
        handler: &'a dyn InterruptHandler,
    ) -> Result<(), Self::Error>;

    /// Unmask interrupt line `source`.
    fn enable(&mut self, source: u16);
}

//! Mode transitions, bit timing and transmission on a controller

use canloop_core::{Controller, Mode};
use thiserror_no_std::Error;

use crate::config::{BitTimingError, Timing};
use crate::fmt::{debug, error};
use crate::interrupt::InterruptSet;
use crate::message::Frame;

/// Errors that may occur during configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigurationError {
    /// The controller did not report the requested mode in time
    #[error("controller did not enter {target:?} mode")]
    ModeTransitionTimeout {
        /// Mode that was requested
        target: Mode,
    },
    /// The operation requires configuration mode
    #[error("operation requires configuration mode, controller is in {current:?} mode")]
    WrongMode {
        /// Mode the controller reported
        current: Mode,
    },
    /// Problems with the bit timing configuration
    #[error("invalid bit timing: {0:?}")]
    BitTiming(BitTimingError),
    /// The built-in diagnostic of the controller failed
    #[error("controller self-test failed")]
    SelfTestFailed,
}

impl From<BitTimingError> for ConfigurationError {
    fn from(value: BitTimingError) -> Self {
        Self::BitTiming(value)
    }
}

/// Errors that may occur when handing a frame to the controller
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransmitError {
    /// Frames can only be sent in normal or loopback mode
    #[error("cannot transmit in {current:?} mode")]
    WrongMode {
        /// Mode the controller reported
        current: Mode,
    },
    /// The controller refused the frame
    #[error("controller rejected the frame")]
    Rejected,
}

/// Drives the configuration state machine of a single controller.
///
/// The controller acknowledges mode changes asynchronously, so every request
/// is followed by polling [`Controller::mode`], at most
/// `mode_transition_spins + 1` times.
pub struct Configurator<'a, C> {
    can: &'a C,
    mode_transition_spins: u32,
}

impl<'a, C: Controller> Configurator<'a, C> {
    /// Wrap `can`. Mode transitions give up after `mode_transition_spins`
    /// polls.
    pub fn new(can: &'a C, mode_transition_spins: u32) -> Self {
        Self {
            can,
            mode_transition_spins,
        }
    }

    /// Controller this configurator drives
    pub fn controller(&self) -> &'a C {
        self.can
    }

    /// Mode the controller currently reports
    pub fn mode(&self) -> Mode {
        self.can.mode()
    }

    /// Request `target` and wait until the controller reports it.
    pub fn enter_mode(&self, target: Mode) -> Result<(), ConfigurationError> {
        self.can.enter_mode(target);
        for _ in 0..=self.mode_transition_spins {
            if self.can.mode() == target {
                debug!("entered {} mode", target);
                return Ok(());
            }
            core::hint::spin_loop();
        }
        error!("timed out entering {} mode", target);
        Err(ConfigurationError::ModeTransitionTimeout { target })
    }

    /// Program the baud rate prescaler and the bit timing register.
    ///
    /// The controller must be in [`Mode::Configuration`]. Every parameter is
    /// validated before any register is written, so a rejected timing leaves
    /// the previous one in place.
    pub fn set_timing(&self, timing: &Timing) -> Result<(), ConfigurationError> {
        let current = self.can.mode();
        if current != Mode::Configuration {
            return Err(ConfigurationError::WrongMode { current });
        }
        let registers = timing.registers()?;
        self.can.set_baud_prescaler(registers.prescaler);
        self.can
            .set_bit_timing(registers.sjw, registers.ts1, registers.ts2);
        if let Some(bitrate) = timing.bitrate(self.can.can_clock()) {
            debug!("bit timing set, {} bit/s", bitrate.to_Hz());
        }
        Ok(())
    }

    /// Run the built-in diagnostic of the controller.
    pub fn run_self_test(&self) -> Result<(), ConfigurationError> {
        self.can.self_test().map_err(|_e| {
            error!("controller self-test failed");
            ConfigurationError::SelfTestFailed
        })
    }

    /// Unmask the interrupt sources in `interrupts` at the controller.
    pub fn enable_interrupts(&self, interrupts: InterruptSet) {
        self.can.enable_interrupts(interrupts.bits());
    }

    /// Puts a frame in the transmit FIFO.
    /// Fails with [`nb::Error::WouldBlock`] if the FIFO is full.
    pub fn transmit(&self, frame: &Frame) -> nb::Result<(), TransmitError> {
        let current = self.can.mode();
        if !current.is_operational() {
            return Err(nb::Error::Other(TransmitError::WrongMode { current }));
        }
        if self.can.is_tx_fifo_full() {
            return Err(nb::Error::WouldBlock);
        }
        self.can
            .send(&frame.to_raw())
            .map_err(|_e| nb::Error::Other(TransmitError::Rejected))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TEST_TIMING;
    use canloop_core::{fugit, RawFrame};
    use core::cell::Cell;
    use critical_section::Mutex;

    /// Controller whose mode follows requests after `lag` polls
    struct Registers {
        mode: Mutex<Cell<Mode>>,
        target: Mutex<Cell<Mode>>,
        lag: Mutex<Cell<u32>>,
        stuck: bool,
        prescaler: Mutex<Cell<u8>>,
        bit_timing: Mutex<Cell<(u8, u8, u8)>>,
        fifo_full: Mutex<Cell<bool>>,
        sent: Mutex<Cell<Option<RawFrame>>>,
    }

    impl Registers {
        fn new(lag: u32, stuck: bool) -> Self {
            Self {
                mode: Mutex::new(Cell::new(Mode::Reset)),
                target: Mutex::new(Cell::new(Mode::Reset)),
                lag: Mutex::new(Cell::new(lag)),
                stuck,
                prescaler: Mutex::new(Cell::new(0)),
                bit_timing: Mutex::new(Cell::new((0, 0, 0))),
                fifo_full: Mutex::new(Cell::new(false)),
                sent: Mutex::new(Cell::new(None)),
            }
        }

        fn get<T: Copy>(&self, field: &Mutex<Cell<T>>) -> T {
            critical_section::with(|cs| field.borrow(cs).get())
        }

        fn set<T>(&self, field: &Mutex<Cell<T>>, value: T) {
            critical_section::with(|cs| field.borrow(cs).set(value))
        }
    }

    impl Controller for Registers {
        type Error = ();

        fn initialize(&self, _: u16) -> Result<(), ()> {
            Ok(())
        }
        fn self_test(&self) -> Result<(), ()> {
            Err(())
        }
        fn enter_mode(&self, mode: Mode) {
            self.set(&self.target, mode);
        }
        fn mode(&self) -> Mode {
            let lag = self.get(&self.lag);
            if lag > 0 {
                self.set(&self.lag, lag - 1);
            } else if !self.stuck {
                self.set(&self.mode, self.get(&self.target));
            }
            self.get(&self.mode)
        }
        fn set_baud_prescaler(&self, value: u8) {
            self.set(&self.prescaler, value);
        }
        fn set_bit_timing(&self, sjw: u8, ts1: u8, ts2: u8) {
            self.set(&self.bit_timing, (sjw, ts1, ts2));
        }
        fn is_tx_fifo_full(&self) -> bool {
            self.get(&self.fifo_full)
        }
        fn send(&self, frame: &RawFrame) -> Result<(), ()> {
            self.set(&self.sent, Some(*frame));
            Ok(())
        }
        fn recv(&self) -> Result<RawFrame, ()> {
            Err(())
        }
        fn enable_interrupts(&self, _: u32) {}
        fn interrupt_status(&self) -> u32 {
            0
        }
        fn clear_interrupts(&self, _: u32) {}
        fn error_status(&self) -> u32 {
            0
        }
        fn clear_error_status(&self, _: u32) {}
        fn can_clock(&self) -> fugit::HertzU32 {
            fugit::HertzU32::MHz(24)
        }
    }

    #[test]
    fn enter_mode_polls_until_acknowledged() {
        let can = Registers::new(5, false);
        let bus = Configurator::new(&can, 10);
        assert_eq!(bus.enter_mode(Mode::Configuration), Ok(()));
        assert_eq!(bus.mode(), Mode::Configuration);
    }

    #[test]
    fn enter_mode_times_out() {
        let can = Registers::new(0, true);
        let bus = Configurator::new(&can, 10);
        assert_eq!(
            bus.enter_mode(Mode::Loopback),
            Err(ConfigurationError::ModeTransitionTimeout {
                target: Mode::Loopback
            })
        );
    }

    #[test]
    fn set_timing_writes_register_encoding() {
        let can = Registers::new(0, false);
        let bus = Configurator::new(&can, 10);
        bus.enter_mode(Mode::Configuration).unwrap();
        bus.set_timing(&TEST_TIMING).unwrap();
        assert_eq!(can.get(&can.prescaler), 29);
        assert_eq!(can.get(&can.bit_timing), (3, 15, 2));
    }

    #[test]
    fn set_timing_requires_configuration_mode() {
        let can = Registers::new(0, false);
        let bus = Configurator::new(&can, 10);
        bus.enter_mode(Mode::Normal).unwrap();
        assert_eq!(
            bus.set_timing(&TEST_TIMING),
            Err(ConfigurationError::WrongMode {
                current: Mode::Normal
            })
        );
        assert_eq!(can.get(&can.prescaler), 0);
    }

    #[test]
    fn invalid_timing_leaves_registers_untouched() {
        let can = Registers::new(0, false);
        let bus = Configurator::new(&can, 10);
        bus.enter_mode(Mode::Configuration).unwrap();
        bus.set_timing(&TEST_TIMING).unwrap();
        let invalid = Timing {
            phase_seg_2: 0,
            ..TEST_TIMING
        };
        assert_eq!(
            bus.set_timing(&invalid),
            Err(ConfigurationError::BitTiming(
                BitTimingError::PhaseSeg2OutOfRange(1..=8)
            ))
        );
        assert_eq!(can.get(&can.prescaler), 29);
        assert_eq!(can.get(&can.bit_timing), (3, 15, 2));
    }

    #[test]
    fn self_test_failure_is_reported() {
        let can = Registers::new(0, false);
        let bus = Configurator::new(&can, 10);
        assert_eq!(bus.run_self_test(), Err(ConfigurationError::SelfTestFailed));
    }

    #[test]
    fn transmit_blocks_while_fifo_is_full() {
        let can = Registers::new(0, false);
        let bus = Configurator::new(&can, 10);
        let frame = Frame::encode(crate::config::TEST_ID, &[1, 2, 3]).unwrap();
        assert_eq!(
            bus.transmit(&frame),
            Err(nb::Error::Other(TransmitError::WrongMode {
                current: Mode::Reset
            }))
        );

        bus.enter_mode(Mode::Loopback).unwrap();
        can.set(&can.fifo_full, true);
        assert_eq!(bus.transmit(&frame), Err(nb::Error::WouldBlock));
        assert_eq!(can.get(&can.sent), None);

        can.set(&can.fifo_full, false);
        assert_eq!(bus.transmit(&frame), Ok(()));
        assert_eq!(can.get(&can.sent), Some(frame.to_raw()));
    }
}

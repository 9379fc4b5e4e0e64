//! CAN bus configuration

use core::ops::RangeInclusive;
use embedded_can::StandardId;
use fugit::HertzU32;

/// Bit-timing parameters as programmed into the controller
///
/// The bit time is determined by
/// - the time quantum `t_q`, which is `prescaler` periods of the CAN clock
/// - the number of time quanta in a bit time, `1 + phase_seg_1 + phase_seg_2`
///
/// This struct expects *real* values, the subtraction the HW register expects
/// is handled by the driver. Valid ranges are listed in [`TIMING_RANGES`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timing {
    /// Baud rate prescaler
    pub prescaler: u16,
    /// Synchronization jump width
    pub sjw: u8,
    /// Propagation time and phase time before sample point
    pub phase_seg_1: u8,
    /// Time after sample point
    pub phase_seg_2: u8,
}

/// Register values of a [`Timing`], each one less than the real value.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct TimingRegisters {
    pub prescaler: u8,
    pub sjw: u8,
    pub ts1: u8,
    pub ts2: u8,
}

impl Timing {
    /// Returns the number of time quanta that make up one bit time, `t_bit /
    /// t_q`
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.phase_seg_1) + u32::from(self.phase_seg_2)
    }

    /// Check every parameter against the controller limits.
    pub fn check(&self) -> Result<(), BitTimingError> {
        let valid = &TIMING_RANGES;
        if !valid.prescaler.contains(&self.prescaler.into()) {
            Err(BitTimingError::PrescalerOutOfRange(valid.prescaler.clone()))
        } else {
            check_segments(self.sjw, self.phase_seg_1, self.phase_seg_2, valid)
        }
    }

    /// Bit rate produced by this timing when the controller runs from
    /// `can_clock`. `None` for a zero prescaler.
    pub fn bitrate(&self, can_clock: HertzU32) -> Option<HertzU32> {
        u32::from(self.prescaler)
            .checked_mul(self.time_quanta_per_bit())
            .filter(|&divider| divider != 0)
            .map(|divider| can_clock / divider)
    }

    pub(crate) fn registers(&self) -> Result<TimingRegisters, BitTimingError> {
        self.check()?;
        // The ranges guarantee every field is at least 1 and fits after the
        // subtraction.
        Ok(TimingRegisters {
            prescaler: (self.prescaler - 1) as u8,
            sjw: self.sjw - 1,
            ts1: self.phase_seg_1 - 1,
            ts2: self.phase_seg_2 - 1,
        })
    }
}

/// Bit timing described by the desired bitrate
///
/// Default values are:
/// - sjw: 4
/// - phase_seg_1: 16
/// - phase_seg_2: 3
///
/// Default time quanta in a bit time is 20 (phase_seg_1 + phase_seg_2 +
/// synchronization segment (1))
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BitTiming {
    /// Synchronization jump width
    pub sjw: u8,
    /// Propagation time and phase time before sample point
    pub phase_seg_1: u8,
    /// Time after sample point
    pub phase_seg_2: u8,
    /// The bitrate of the bus. This needs to be chosen so that the CAN clock
    /// is divisible into time quanta such that the bit time determined by
    /// `phase_seg_1` and `phase_seg_2` is a whole number of time quanta.
    pub bitrate: HertzU32,
}

impl BitTiming {
    /// Create an instance
    ///
    /// Bitrate value must be provided, all other settings come pre-populated
    /// with default values.
    pub fn new(bitrate: HertzU32) -> Self {
        Self {
            sjw: 4,
            phase_seg_1: 16,
            phase_seg_2: 3,
            bitrate,
        }
    }

    /// Returns the number of time quanta that make up one bit time
    pub fn time_quanta_per_bit(&self) -> u32 {
        1 + u32::from(self.phase_seg_1) + u32::from(self.phase_seg_2)
    }

    /// Find the prescaler producing `bitrate` from `can_clock`.
    pub fn resolve(&self, can_clock: HertzU32) -> Result<Timing, BitTimingError> {
        let valid = &TIMING_RANGES;
        check_segments(self.sjw, self.phase_seg_1, self.phase_seg_2, valid)?;
        let bit_time_quanta = self.time_quanta_per_bit();
        let f_q = self.bitrate.to_Hz().checked_mul(bit_time_quanta);
        if let Some(f_q) = f_q.filter(|&f_q| can_clock.to_Hz().checked_rem(f_q) == Some(0)) {
            let prescaler = can_clock.to_Hz() / f_q;
            if !valid.prescaler.contains(&prescaler) {
                Err(BitTimingError::PrescalerOutOfRange(valid.prescaler.clone()))
            } else {
                Ok(Timing {
                    prescaler: prescaler as u16,
                    sjw: self.sjw,
                    phase_seg_1: self.phase_seg_1,
                    phase_seg_2: self.phase_seg_2,
                })
            }
        } else {
            Err(BitTimingError::NoValidPrescaler {
                can_clock,
                bitrate: self.bitrate,
                bit_time_quanta,
            })
        }
    }
}

/// Misconfigurations of [`Timing`] and [`BitTiming`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitTimingError {
    /// SJW is outside the wrapped `RangeInclusive`
    SynchronizationJumpWidthOutOfRange(RangeInclusive<u32>),
    /// Phase segment 1 is outside the wrapped `RangeInclusive`
    PhaseSeg1OutOfRange(RangeInclusive<u32>),
    /// Phase segment 2 is outside the wrapped `RangeInclusive`
    PhaseSeg2OutOfRange(RangeInclusive<u32>),
    /// Prescaler is outside the wrapped `RangeInclusive`
    PrescalerOutOfRange(RangeInclusive<u32>),
    /// No valid prescaler could be found
    ///
    /// The following requirement must be met:
    /// - `can_clock` must be divisible by `bitrate * bit_time_quanta`
    NoValidPrescaler {
        /// Provided controller clock
        can_clock: HertzU32,
        /// Bitrate requested in [`BitTiming`]
        bitrate: HertzU32,
        /// Time quanta per bit selected by [`BitTiming`]
        bit_time_quanta: u32,
    },
}

#[cfg(feature = "defmt")]
impl defmt::Format for BitTimingError {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Self::SynchronizationJumpWidthOutOfRange(r) => {
                defmt::write!(f, "SJW out of {=u32}..={=u32}", r.start(), r.end())
            }
            Self::PhaseSeg1OutOfRange(r) => {
                defmt::write!(f, "TS1 out of {=u32}..={=u32}", r.start(), r.end())
            }
            Self::PhaseSeg2OutOfRange(r) => {
                defmt::write!(f, "TS2 out of {=u32}..={=u32}", r.start(), r.end())
            }
            Self::PrescalerOutOfRange(r) => {
                defmt::write!(f, "prescaler out of {=u32}..={=u32}", r.start(), r.end())
            }
            Self::NoValidPrescaler {
                can_clock,
                bitrate,
                bit_time_quanta,
            } => defmt::write!(
                f,
                "no prescaler for {} from {} with {=u32} tq",
                bitrate,
                can_clock,
                bit_time_quanta
            ),
        }
    }
}

/// Valid values of a [`Timing`] struct
#[derive(Clone)]
pub struct TimingRanges {
    sjw: RangeInclusive<u32>,
    phase_seg_1: RangeInclusive<u32>,
    phase_seg_2: RangeInclusive<u32>,
    prescaler: RangeInclusive<u32>,
}

/// Limits of the controller's baud rate prescaler and bit timing registers
pub const TIMING_RANGES: TimingRanges = TimingRanges {
    sjw: 1..=4,
    phase_seg_1: 1..=16,
    phase_seg_2: 1..=8,
    prescaler: 1..=256,
};

fn check_segments(
    sjw: u8,
    phase_seg_1: u8,
    phase_seg_2: u8,
    valid: &TimingRanges,
) -> Result<(), BitTimingError> {
    if !valid.sjw.contains(&sjw.into()) {
        Err(BitTimingError::SynchronizationJumpWidthOutOfRange(
            valid.sjw.clone(),
        ))
    } else if !valid.phase_seg_1.contains(&phase_seg_1.into()) {
        Err(BitTimingError::PhaseSeg1OutOfRange(
            valid.phase_seg_1.clone(),
        ))
    } else if !valid.phase_seg_2.contains(&phase_seg_2.into()) {
        Err(BitTimingError::PhaseSeg2OutOfRange(
            valid.phase_seg_2.clone(),
        ))
    } else {
        Ok(())
    }
}

/// Identifier the self-test transmits
pub const TEST_ID: StandardId = match StandardId::new(1024) {
    Some(id) => id,
    None => panic!("test identifier exceeds 11 bits"),
};

/// Payload the self-test transmits
pub const TEST_PAYLOAD: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 7];

/// Timing the self-test programs: 20 time quanta per bit, prescaler 30
pub const TEST_TIMING: Timing = Timing {
    prescaler: 30,
    sjw: 4,
    phase_seg_1: 16,
    phase_seg_2: 3,
};

/// Configuration for the loopback self-test
#[derive(Debug, Copy, Clone)]
pub struct SelfTestConfig {
    /// Controller instance handed to [`Controller::initialize`]
    ///
    /// [`Controller::initialize`]: canloop_core::Controller::initialize
    pub device_id: u16,
    /// Interrupt line of the controller on the platform interrupt controller
    pub interrupt_source: u16,
    /// Identifier of the test frame
    pub test_id: StandardId,
    /// Payload of the test frame, at most 8 bytes
    pub payload: &'static [u8],
    /// Timing programmed in configuration mode
    pub timing: Timing,
    /// Number of polls of the controller mode before a transition is
    /// considered to have failed
    pub mode_transition_spins: u32,
    /// Bound on the completion wait, in polls. `None` waits forever.
    pub completion_spins: Option<u32>,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            interrupt_source: 60,
            test_id: TEST_ID,
            payload: &TEST_PAYLOAD,
            timing: TEST_TIMING,
            mode_transition_spins: 1_000_000,
            completion_spins: None,
        }
    }
}

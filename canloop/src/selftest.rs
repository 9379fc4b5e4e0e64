//! Loopback self-test
//!
//! [`SelfTest::run`] brings a controller from reset into loopback mode,
//! sends a single frame and checks that the same frame comes back through the
//! receive interrupt. Every step is fail fast; there are no retries.

use core::fmt;
use core::fmt::Debug;

use canloop_core::{Controller, InterruptBridge, Mode};
use embassy_sync::blocking_mutex::raw::RawMutex;
use thiserror_no_std::Error;

use crate::bus::{ConfigurationError, Configurator};
use crate::config::SelfTestConfig;
use crate::fmt::{debug, error, info};
use crate::interrupt::dispatch::Dispatcher;
use crate::interrupt::{ErrorSet, InterruptSet};
use crate::message::{Frame, FrameError, Mismatch};
use crate::transfer::{Coordinator, FailReason, Outcome};

/// Progress of a self-test run
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Stage {
    /// Nothing done yet
    Init,
    /// Controller initialized and its diagnostic passed
    SelfTested,
    /// Bit timing programmed
    Configured,
    /// Interrupt handler registered and enabled
    CallbacksInstalled,
    /// Controller reports loopback mode
    LoopbackEntered,
    /// Test frame handed to the controller
    Sent,
    /// Both directions of the transfer settled
    Settled,
    /// Received frame matched the one sent
    Passed,
}

/// Reasons a self-test fails
#[derive(Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TestError<E: Debug> {
    /// The controller could not be initialized
    #[error("controller initialization failed: {0:?}")]
    InitFailure(E),
    /// The controller diagnostic failed
    #[error("controller self-test failed")]
    SelfTestFailure,
    /// The controller did not report a requested mode in time
    #[error("controller did not enter {target:?} mode")]
    ModeTransitionTimeout {
        /// Mode that was requested
        target: Mode,
    },
    /// Bit timing could not be programmed
    #[error("configuration failed: {0}")]
    ConfigurationFailure(ConfigurationError),
    /// The interrupt bridge refused the handler
    #[error("interrupt handler could not be registered")]
    CallbackInstallFailure,
    /// The configured test frame cannot be encoded
    #[error("invalid test frame: {0}")]
    InvalidTestFrame(FrameError),
    /// The controller rejected the test frame
    #[error("controller rejected the test frame")]
    SendFailure,
    /// The received frame could not be read or decoded
    #[error("receive error")]
    ReceiveError,
    /// The controller flagged bus errors during the transfer
    #[error("bus error: {0:?}")]
    BusError(ErrorSet),
    /// The controller went bus-off during the transfer
    #[error("controller went bus-off")]
    BusOff,
    /// The frame received differs from the frame sent
    #[error("verification failed, {0}")]
    VerificationMismatch(Mismatch),
    /// The bounded completion wait ran out
    #[error("transfer did not complete in time")]
    CompletionTimeout,
}

impl<E: Debug> From<ConfigurationError> for TestError<E> {
    fn from(value: ConfigurationError) -> Self {
        match value {
            ConfigurationError::ModeTransitionTimeout { target } => {
                Self::ModeTransitionTimeout { target }
            }
            ConfigurationError::SelfTestFailed => Self::SelfTestFailure,
            other => Self::ConfigurationFailure(other),
        }
    }
}

impl<E: Debug> From<FrameError> for TestError<E> {
    fn from(value: FrameError) -> Self {
        Self::InvalidTestFrame(value)
    }
}

impl<E: Debug> From<Mismatch> for TestError<E> {
    fn from(value: Mismatch) -> Self {
        Self::VerificationMismatch(value)
    }
}

/// Verdict of a self-test run
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Report<E: Debug> {
    /// The frame made the round trip unchanged
    Passed,
    /// The run stopped early
    Failed {
        /// Last stage reached before the failure
        stage: Stage,
        /// What went wrong
        error: TestError<E>,
    },
}

impl<E: Debug> Report<E> {
    /// `true` for [`Report::Passed`]
    pub fn passed(&self) -> bool {
        matches!(self, Report::Passed)
    }

    /// Process exit status: 0 on success, 1 on any failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Report::Passed => 0,
            Report::Failed { .. } => 1,
        }
    }
}

impl<E: Debug> fmt::Display for Report<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Passed => write!(f, "CAN loopback self-test passed"),
            Report::Failed { stage, error } => {
                write!(f, "CAN loopback self-test failed after {:?}: {}", stage, error)
            }
        }
    }
}

/// Loopback self-test of one controller.
///
/// The test borrows itself for `'a` when it runs, because the interrupt
/// handler it registers lives inside it.
pub struct SelfTest<'a, C, M: RawMutex> {
    bus: Configurator<'a, C>,
    coordinator: &'a Coordinator<M>,
    dispatcher: Dispatcher<'a, C, Coordinator<M>>,
    config: SelfTestConfig,
}

impl<'a, C: Controller, M: RawMutex + Sync> SelfTest<'a, C, M> {
    /// Prepare a self-test of `can`, tracking the transfer in `coordinator`.
    pub fn new(can: &'a C, coordinator: &'a Coordinator<M>, config: SelfTestConfig) -> Self {
        Self {
            bus: Configurator::new(can, config.mode_transition_spins),
            coordinator,
            dispatcher: Dispatcher::new(can, coordinator),
            config,
        }
    }

    /// Configuration the test runs with
    pub fn config(&self) -> &SelfTestConfig {
        &self.config
    }

    /// Run the test, registering the interrupt handler with `bridge`.
    ///
    /// May be called repeatedly; each run resets the transfer state before
    /// sending.
    pub fn run<B: InterruptBridge<'a>>(&'a self, bridge: &mut B) -> Report<C::Error> {
        let mut stage = Stage::Init;
        match self.execute(bridge, &mut stage) {
            Ok(()) => {
                info!("self-test passed");
                Report::Passed
            }
            Err(error) => {
                error!("self-test failed after stage {}", stage);
                Report::Failed { stage, error }
            }
        }
    }

    fn execute<B: InterruptBridge<'a>>(
        &'a self,
        bridge: &mut B,
        stage: &mut Stage,
    ) -> Result<(), TestError<C::Error>> {
        let can = self.bus.controller();
        let config = &self.config;

        can.initialize(config.device_id).map_err(TestError::InitFailure)?;
        self.bus.run_self_test()?;
        advance(stage, Stage::SelfTested);

        self.bus.enter_mode(Mode::Configuration)?;
        self.bus.set_timing(&config.timing)?;
        advance(stage, Stage::Configured);

        bridge
            .register(config.interrupt_source, &self.dispatcher)
            .map_err(|_e| TestError::CallbackInstallFailure)?;
        bridge.enable(config.interrupt_source);
        advance(stage, Stage::CallbacksInstalled);

        self.coordinator.reset_outcomes();
        self.bus.enable_interrupts(InterruptSet::ALL);
        self.bus.enter_mode(Mode::Loopback)?;
        advance(stage, Stage::LoopbackEntered);

        let frame = Frame::encode(config.test_id, config.payload)?;
        nb::block!(self.bus.transmit(&frame)).map_err(|_e| TestError::SendFailure)?;
        advance(stage, Stage::Sent);

        let (send, receive) = match config.completion_spins {
            Some(spins) => self
                .coordinator
                .wait_for_both_within(spins)
                .map_err(|_timeout| TestError::CompletionTimeout)?,
            None => self.coordinator.wait_for_both(),
        };
        advance(stage, Stage::Settled);

        check(send)?;
        check(receive)?;
        let received = self
            .coordinator
            .received_frame()
            .ok_or(TestError::ReceiveError)?;
        received.expect(config.test_id, config.payload)?;
        advance(stage, Stage::Passed);
        Ok(())
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    debug!("self-test stage {}", next);
    *stage = next;
}

fn check<E: Debug>(outcome: Outcome) -> Result<(), TestError<E>> {
    match outcome {
        Outcome::Failed(FailReason::ReceiveError) => Err(TestError::ReceiveError),
        Outcome::Failed(FailReason::BusError(errors)) => Err(TestError::BusError(errors)),
        Outcome::Failed(FailReason::BusOff) => Err(TestError::BusOff),
        Outcome::Pending | Outcome::Done => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::Field;

    #[test]
    fn report_exit_codes() {
        assert_eq!(Report::<()>::Passed.exit_code(), 0);
        let failed = Report::<()>::Failed {
            stage: Stage::Sent,
            error: TestError::BusOff,
        };
        assert_eq!(failed.exit_code(), 1);
        assert!(!failed.passed());
    }

    #[test]
    fn report_display_names_stage_and_reason() {
        let failed = Report::<()>::Failed {
            stage: Stage::Settled,
            error: TestError::VerificationMismatch(Mismatch {
                field: Field::Identifier,
                expected: 1024,
                actual: 1000,
            }),
        };
        assert_eq!(
            failed.to_string(),
            "CAN loopback self-test failed after Settled: \
             verification failed, identifier: expected 1024, got 1000"
        );
        assert_eq!(Report::<()>::Passed.to_string(), "CAN loopback self-test passed");
    }

    #[test]
    fn configuration_errors_map_to_test_errors() {
        let timeout: TestError<()> = ConfigurationError::ModeTransitionTimeout {
            target: Mode::Loopback,
        }
        .into();
        assert_eq!(
            timeout,
            TestError::ModeTransitionTimeout {
                target: Mode::Loopback
            }
        );
        let wrong_mode: TestError<()> = ConfigurationError::WrongMode {
            current: Mode::Normal,
        }
        .into();
        assert!(matches!(wrong_mode, TestError::ConfigurationFailure(_)));
    }

    #[test]
    fn failed_outcomes_map_to_test_errors() {
        assert_eq!(check::<()>(Outcome::Done), Ok(()));
        assert_eq!(
            check::<()>(Outcome::Failed(FailReason::BusOff)),
            Err(TestError::BusOff)
        );
        assert_eq!(
            check::<()>(Outcome::Failed(FailReason::ReceiveError)),
            Err(TestError::ReceiveError)
        );
    }
}

/// Test doubles simulating a CAN controller in loopback mode and the platform
/// interrupt controller.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use canloop::config::SelfTestConfig;
use canloop::core::fugit::HertzU32;
use canloop::core::{Controller, InterruptBridge, InterruptHandler, Mode, RawFrame};
use canloop::embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use canloop::selftest::SelfTest;
use canloop::transfer::Coordinator;

const ARBLST: u32 = 1 << 0;
const TXOK: u32 = 1 << 1;
const RXOK: u32 = 1 << 4;
const RXNEMP: u32 = 1 << 7;
const ERROR: u32 = 1 << 8;
const BSOFF: u32 = 1 << 9;

/// Bit error flag of the error status register
pub const ESR_BIT: u32 = 1 << 3;

pub type TestMutex = CriticalSectionRawMutex;
pub type LoopbackSelfTest = SelfTest<'static, LoopbackController, TestMutex>;

/// Failures reported by the simulated controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    UnknownDevice(u16),
    DiagnosticFailed,
    Rejected,
    FifoEmpty,
}

/// Knobs selecting misbehaviour of the simulated controller
#[derive(Default)]
#[allow(dead_code)]
pub struct Faults {
    /// Identifier the looped back frame carries instead of the sent one
    pub corrupt_id: Option<u16>,
    /// Raise a bit error with the next transmission
    pub bit_error: AtomicBool,
    /// Go bus-off with every transmission
    pub bus_off: bool,
    /// Frames are transmitted but never reach the receive FIFO
    pub drop_looped_frame: bool,
    /// Diagnostic fails
    pub fail_diagnostic: bool,
    /// Controller refuses frames
    pub reject_send: bool,
    /// Controller never acknowledges loopback mode
    pub stuck_before_loopback: bool,
    /// Interrupts are left for another thread to deliver
    pub deferred_interrupts: bool,
}

struct State {
    mode: Mode,
    prescaler: u8,
    bit_timing: (u8, u8, u8),
    rx: VecDeque<RawFrame>,
}

/// In-memory controller routing transmitted frames back to its receive FIFO.
pub struct LoopbackController {
    state: Mutex<State>,
    handler: Mutex<Option<&'static dyn InterruptHandler>>,
    status: AtomicU32,
    enabled: AtomicU32,
    errors: AtomicU32,
    pub faults: Faults,
}

#[allow(dead_code)]
impl LoopbackController {
    pub fn new(faults: Faults) -> Self {
        Self {
            state: Mutex::new(State {
                mode: Mode::Reset,
                prescaler: 0,
                bit_timing: (0, 0, 0),
                rx: VecDeque::new(),
            }),
            handler: Mutex::new(None),
            status: AtomicU32::new(0),
            enabled: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            faults,
        }
    }

    /// Register values as the hardware holds them
    pub fn timing_registers(&self) -> (u8, (u8, u8, u8)) {
        let state = self.state.lock().unwrap();
        (state.prescaler, state.bit_timing)
    }

    pub fn enabled_interrupts(&self) -> u32 {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Raise arbitration lost without any transfer
    pub fn raise_arbitration_lost(&self) {
        self.status.fetch_or(ARBLST, Ordering::SeqCst);
    }

    /// Invoke the registered handler if an enabled interrupt is flagged.
    /// Returns whether the handler ran.
    pub fn fire(&self) -> bool {
        if self.interrupt_status() == 0 {
            return false;
        }
        let handler = *self.handler.lock().unwrap();
        match handler {
            Some(handler) => {
                handler.handle();
                true
            }
            None => false,
        }
    }
}

impl Controller for LoopbackController {
    type Error = SimError;

    fn initialize(&self, device_id: u16) -> Result<(), SimError> {
        if device_id != 0 {
            return Err(SimError::UnknownDevice(device_id));
        }
        let mut state = self.state.lock().unwrap();
        state.mode = Mode::Reset;
        state.rx.clear();
        self.status.store(0, Ordering::SeqCst);
        self.enabled.store(0, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn self_test(&self) -> Result<(), SimError> {
        if self.faults.fail_diagnostic {
            return Err(SimError::DiagnosticFailed);
        }
        self.state.lock().unwrap().mode = Mode::Configuration;
        Ok(())
    }

    fn enter_mode(&self, mode: Mode) {
        if mode == Mode::Loopback && self.faults.stuck_before_loopback {
            return;
        }
        self.state.lock().unwrap().mode = mode;
    }

    fn mode(&self) -> Mode {
        self.state.lock().unwrap().mode
    }

    fn set_baud_prescaler(&self, value: u8) {
        self.state.lock().unwrap().prescaler = value;
    }

    fn set_bit_timing(&self, sjw: u8, ts1: u8, ts2: u8) {
        self.state.lock().unwrap().bit_timing = (sjw, ts1, ts2);
    }

    fn is_tx_fifo_full(&self) -> bool {
        false
    }

    fn send(&self, frame: &RawFrame) -> Result<(), SimError> {
        if self.faults.reject_send {
            return Err(SimError::Rejected);
        }
        {
            let mut state = self.state.lock().unwrap();
            let mut looped = *frame;
            if let Some(id) = self.faults.corrupt_id {
                looped[0] = (looped[0] & 0x001f_ffff) | (u32::from(id) << 21);
            }
            if !self.faults.drop_looped_frame {
                state.rx.push_back(looped);
            }
        }
        let mut raised = TXOK | RXOK | RXNEMP;
        if self.faults.bus_off {
            raised |= BSOFF;
        }
        if self.faults.bit_error.swap(false, Ordering::SeqCst) {
            self.errors.fetch_or(ESR_BIT, Ordering::SeqCst);
            raised |= ERROR;
        }
        self.status.fetch_or(raised, Ordering::SeqCst);
        if !self.faults.deferred_interrupts {
            self.fire();
        }
        Ok(())
    }

    fn recv(&self) -> Result<RawFrame, SimError> {
        self.state
            .lock()
            .unwrap()
            .rx
            .pop_front()
            .ok_or(SimError::FifoEmpty)
    }

    fn enable_interrupts(&self, mask: u32) {
        self.enabled.fetch_or(mask, Ordering::SeqCst);
    }

    fn interrupt_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst) & self.enabled.load(Ordering::SeqCst)
    }

    fn clear_interrupts(&self, mask: u32) {
        self.status.fetch_and(!mask, Ordering::SeqCst);
    }

    fn error_status(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }

    fn clear_error_status(&self, mask: u32) {
        self.errors.fetch_and(!mask, Ordering::SeqCst);
    }

    fn can_clock(&self) -> HertzU32 {
        HertzU32::MHz(24)
    }
}

/// Interrupt controller storing the handler inside the simulated controller.
pub struct MockBridge {
    can: &'static LoopbackController,
    pub refuse: bool,
    pub enabled: Option<u16>,
}

#[allow(dead_code)]
impl MockBridge {
    pub fn new(can: &'static LoopbackController) -> Self {
        Self {
            can,
            refuse: false,
            enabled: None,
        }
    }
}

impl InterruptBridge<'static> for MockBridge {
    type Error = ();

    fn register(
        &mut self,
        _source: u16,
        handler: &'static dyn InterruptHandler,
    ) -> Result<(), Self::Error> {
        if self.refuse {
            return Err(());
        }
        *self.can.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    fn enable(&mut self, source: u16) {
        self.enabled = Some(source);
    }
}

/// Everything a self-test needs, leaked so that the registered handler is
/// `'static`.
pub struct Rig {
    pub can: &'static LoopbackController,
    pub coordinator: &'static Coordinator<TestMutex>,
    pub test: &'static LoopbackSelfTest,
    pub bridge: MockBridge,
}

#[allow(dead_code)]
impl Rig {
    pub fn new(faults: Faults) -> Self {
        Self::with_config(faults, SelfTestConfig::default())
    }

    pub fn with_config(faults: Faults, config: SelfTestConfig) -> Self {
        let can: &'static LoopbackController = Box::leak(Box::new(LoopbackController::new(faults)));
        let coordinator: &'static Coordinator<TestMutex> = Box::leak(Box::new(Coordinator::new()));
        let test: &'static LoopbackSelfTest =
            Box::leak(Box::new(SelfTest::new(can, coordinator, config)));
        Self {
            can,
            coordinator,
            test,
            bridge: MockBridge::new(can),
        }
    }
}

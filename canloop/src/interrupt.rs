//! Interrupt and error status of the CAN controller

pub mod dispatch;

use bitfield::bitfield;

bitfield! {
    /// A set of CAN interrupts, in the layout of the interrupt status register.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct InterruptSet(u32);

    /// Rx FIFO watermark full
    pub rxfwmfll, set_rxfwmfll: 15;
    /// Tx FIFO empty
    pub txfemp, set_txfemp: 14;
    /// Tx FIFO watermark empty
    pub txfwmemp, set_txfwmemp: 13;
    /// Wake up from sleep
    pub wkup, set_wkup: 11;
    /// Entered sleep mode
    pub slp, set_slp: 10;
    /// Bus off
    pub bsoff, set_bsoff: 9;
    /// Error, details in the error status register
    pub error, set_error: 8;
    /// Rx FIFO not empty
    pub rxnemp, set_rxnemp: 7;
    /// Rx FIFO overflow
    pub rxoflw, set_rxoflw: 6;
    /// Rx FIFO underflow
    pub rxuflw, set_rxuflw: 5;
    /// Frame received
    pub rxok, set_rxok: 4;
    /// High priority Tx buffer full
    pub txbfll, set_txbfll: 3;
    /// Tx FIFO full
    pub txfll, set_txfll: 2;
    /// Frame transmitted
    pub txok, set_txok: 1;
    /// Arbitration lost
    pub arblst, set_arblst: 0;
}

impl FromIterator<Interrupt> for InterruptSet {
    fn from_iter<T: IntoIterator<Item = Interrupt>>(iter: T) -> Self {
        let mut set = 0_u32;
        for int in iter.into_iter() {
            set |= u32::from(int);
        }
        InterruptSet(set)
    }
}

impl core::fmt::Debug for InterruptSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "InterruptSet {{ ")?;
        for int in self.iter() {
            write!(f, "{} ", int.mnemonic())?;
        }
        write!(f, "}}")
    }
}

/// A single interrupt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Interrupt {
    /// ARBLST
    ArbitrationLost = 0,
    /// TXOK
    TransmissionCompleted = 1,
    /// TXFLL
    TxFifoFull = 2,
    /// TXBFLL
    TxHighPriorityBufferFull = 3,
    /// RXOK
    ReceptionCompleted = 4,
    /// RXUFLW
    RxFifoUnderflow = 5,
    /// RXOFLW
    RxFifoOverflow = 6,
    /// RXNEMP
    RxFifoNotEmpty = 7,
    /// ERROR
    Error = 8,
    /// BSOFF
    BusOff = 9,
    /// SLP
    Sleep = 10,
    /// WKUP
    WakeUp = 11,
    /// TXFWMEMP
    TxFifoWatermarkEmpty = 13,
    /// TXFEMP
    TxFifoEmpty = 14,
    /// RXFWMFLL
    RxFifoWatermarkFull = 15,
}

impl From<Interrupt> for u32 {
    fn from(x: Interrupt) -> Self {
        1 << x as u32
    }
}

/// Bit number that does not correspond to an interrupt
#[derive(Debug)]
pub struct InvalidInterruptNumber;

impl TryFrom<u8> for Interrupt {
    type Error = InvalidInterruptNumber;

    fn try_from(value: u8) -> Result<Self, InvalidInterruptNumber> {
        use Interrupt::*;
        let ret = match value {
            0 => ArbitrationLost,
            1 => TransmissionCompleted,
            2 => TxFifoFull,
            3 => TxHighPriorityBufferFull,
            4 => ReceptionCompleted,
            5 => RxFifoUnderflow,
            6 => RxFifoOverflow,
            7 => RxFifoNotEmpty,
            8 => Error,
            9 => BusOff,
            10 => Sleep,
            11 => WakeUp,
            13 => TxFifoWatermarkEmpty,
            14 => TxFifoEmpty,
            15 => RxFifoWatermarkFull,
            12 | 16.. => Err(InvalidInterruptNumber)?,
        };
        Ok(ret)
    }
}

impl Interrupt {
    fn mnemonic(self) -> &'static str {
        use Interrupt::*;
        match self {
            ArbitrationLost => "ARBLST",
            TransmissionCompleted => "TXOK",
            TxFifoFull => "TXFLL",
            TxHighPriorityBufferFull => "TXBFLL",
            ReceptionCompleted => "RXOK",
            RxFifoUnderflow => "RXUFLW",
            RxFifoOverflow => "RXOFLW",
            RxFifoNotEmpty => "RXNEMP",
            Error => "ERROR",
            BusOff => "BSOFF",
            Sleep => "SLP",
            WakeUp => "WKUP",
            TxFifoWatermarkEmpty => "TXFWMEMP",
            TxFifoEmpty => "TXFEMP",
            RxFifoWatermarkFull => "RXFWMFLL",
        }
    }
}

impl InterruptSet {
    /// Every interrupt source the controller provides
    pub const ALL: Self = Self(0xefff);

    /// Asynchronous events that are routed to the event callback
    pub const EVENTS: Self = Self(0xee6d);

    /// `true` if no interrupt is flagged
    pub fn is_empty(&self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// Interrupts present in both sets
    pub fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Raw register value
    pub fn bits(self) -> u32 {
        self.0
    }

    /// An iterator visiting all elements in ascending bit order.
    pub fn iter(&self) -> Iter {
        Iter {
            flags: *self,
            index: 0,
        }
    }
}

impl From<u32> for InterruptSet {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// An iterator over the items of an [`InterruptSet`].
///
/// This `struct` is created by [`InterruptSet::iter`].
pub struct Iter {
    flags: InterruptSet,
    index: u8,
}

impl Iterator for Iter {
    type Item = Interrupt;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < 16 {
            let i = self.index;
            self.index += 1;
            if self.flags.0 & (1 << i) != 0 {
                if let Ok(int) = Interrupt::try_from(i) {
                    return Some(int);
                }
            }
        }
        None
    }
}

bitfield! {
    /// Classification of bus errors
    ///
    /// The five protocol error flags share the layout of the controller's
    /// error status register. Bus-off and receive overflow are folded in by
    /// the dispatcher from the interrupt status.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    #[cfg_attr(feature = "defmt", derive(defmt::Format))]
    pub struct ErrorSet(u8);

    /// CRC error
    pub crc, set_crc: 0;
    /// Form error
    pub form, set_form: 1;
    /// Stuff error
    pub stuff, set_stuff: 2;
    /// Bit error
    pub bit_error, set_bit_error: 3;
    /// Acknowledgement error
    pub ack, set_ack: 4;
    /// Controller went bus-off
    pub bus_off, set_bus_off: 5;
    /// Receive FIFO overflowed
    pub rx_overflow, set_rx_overflow: 6;
}

impl ErrorSet {
    /// Flags latched in the error status register
    pub const STATUS_MASK: u32 = 0x1f;

    /// Build the classification from the error status register and the
    /// interrupt status it was reported with.
    pub fn from_status(error_status: u32, interrupts: InterruptSet) -> Self {
        let mut set = Self((error_status & Self::STATUS_MASK) as u8);
        set.set_bus_off(interrupts.bsoff());
        set.set_rx_overflow(interrupts.rxoflw());
        set
    }

    /// `true` if no flag is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Flags present in either set
    pub fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Raw value
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Reconstruct from [`Self::bits`]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 0x7f)
    }

    /// Names of the flags present, in bit order
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        const NAMES: [&str; 7] = ["CRC", "Form", "Stuff", "Bit", "Ack", "BusOff", "RxOverflow"];
        NAMES
            .into_iter()
            .enumerate()
            .filter(move |(i, _)| self.0 & (1 << i) != 0)
            .map(|(_, name)| name)
    }
}

impl core::fmt::Debug for ErrorSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

//! Handling of messages/frames
//!
//! The controller stores a frame in four 32-bit words:
//!
//! | word | content                                                        |
//! |------|----------------------------------------------------------------|
//! | 0    | standard identifier in bits 31..21, SRR/IDE/extended ID/RTR    |
//! | 1    | data length code in bits 31..28, receive timestamp in 15..0    |
//! | 2    | payload bytes 0..=3, byte 0 in the most significant byte       |
//! | 3    | payload bytes 4..=7                                            |

mod header;

use core::fmt;

use canloop_core::{RawFrame, FRAME_WORDS};
use embedded_can::{Id, StandardId};
use thiserror_no_std::Error;

use header::{DlcWord, IdWord};

/// Largest payload a classic data frame can carry.
pub const MAX_DATA_LEN: usize = 8;

/// Number of header words preceding the payload.
const HEADER_WORDS: usize = 2;

/// Reasons a frame cannot be built or parsed.
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameError {
    /// Payload does not fit in a classic frame
    #[error("payload of {len} bytes exceeds 8 bytes")]
    InvalidLength {
        /// Length of the rejected payload
        len: usize,
    },
    /// Header words do not describe a standard data frame with DLC 0..=8
    #[error("malformed frame header")]
    Malformed,
    /// Fewer words were provided than the DLC demands
    #[error("frame needs {needed} words, only {available} available")]
    Truncated {
        /// Words demanded by the header
        needed: usize,
        /// Words provided
        available: usize,
    },
}

/// Standard data frame with up to 8 bytes of payload.
///
/// The data length code always equals the payload length.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    id: StandardId,
    dlc: u8,
    data: [u8; MAX_DATA_LEN],
}

impl Frame {
    /// Build a frame carrying `payload`.
    pub fn encode(id: StandardId, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_DATA_LEN {
            return Err(FrameError::InvalidLength { len: payload.len() });
        }
        let mut data = [0; MAX_DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            dlc: payload.len() as u8,
            data,
        })
    }

    /// Parse a frame read from the receive FIFO.
    ///
    /// Payload bytes beyond the data length code are ignored, as is the
    /// receive timestamp.
    pub fn decode(raw: &[u32]) -> Result<Self, FrameError> {
        if raw.len() < HEADER_WORDS {
            return Err(FrameError::Truncated {
                needed: HEADER_WORDS,
                available: raw.len(),
            });
        }
        let id_word = IdWord(raw[0]);
        if id_word.srr() || id_word.ide() || id_word.rtr() || id_word.id_ext() != 0 {
            return Err(FrameError::Malformed);
        }
        let dlc = DlcWord(raw[1]).dlc();
        if usize::from(dlc) > MAX_DATA_LEN {
            return Err(FrameError::Malformed);
        }
        let needed = HEADER_WORDS + data_words(dlc);
        if raw.len() < needed {
            return Err(FrameError::Truncated {
                needed,
                available: raw.len(),
            });
        }
        let id = StandardId::new(id_word.id()).ok_or(FrameError::Malformed)?;

        let mut data = [0; MAX_DATA_LEN];
        for (chunk, word) in data.chunks_mut(4).zip(&raw[HEADER_WORDS..needed]) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        data[usize::from(dlc)..].fill(0);
        Ok(Self { id, dlc, data })
    }

    /// Frame in the representation the transmit FIFO expects.
    pub fn to_raw(&self) -> RawFrame {
        let mut raw = [0; FRAME_WORDS];
        let mut id_word = IdWord(0);
        id_word.set_id(self.id.as_raw());
        let mut dlc_word = DlcWord(0);
        dlc_word.set_dlc(self.dlc);
        raw[0] = id_word.0;
        raw[1] = dlc_word.0;
        for (word, chunk) in raw[HEADER_WORDS..].iter_mut().zip(self.data().chunks(4)) {
            let mut bytes = [0; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            *word = u32::from_be_bytes(bytes);
        }
        raw
    }

    /// Identifier of the frame
    pub fn id(&self) -> StandardId {
        self.id
    }

    /// Data length code
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// Payload
    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.dlc)]
    }

    /// Compare the frame byte by byte against the expected identifier and
    /// payload. The first field that differs is reported.
    pub fn expect(&self, id: StandardId, payload: &[u8]) -> Result<(), Mismatch> {
        if self.id != id {
            return Err(Mismatch {
                field: Field::Identifier,
                expected: id.as_raw().into(),
                actual: self.id.as_raw().into(),
            });
        }
        if usize::from(self.dlc) != payload.len() {
            return Err(Mismatch {
                field: Field::Dlc,
                expected: payload.len() as u32,
                actual: self.dlc.into(),
            });
        }
        match self
            .data()
            .iter()
            .zip(payload)
            .position(|(actual, expected)| actual != expected)
        {
            Some(index) => Err(Mismatch {
                field: Field::Payload { index: index as u8 },
                expected: payload[index].into(),
                actual: self.data[index].into(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Frame {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(
            f,
            "Frame {{ id: {=u16:#x}, dlc: {=u8}, data: {=[u8]:x} }}",
            self.id.as_raw(),
            self.dlc,
            self.data()
        )
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Standard(id) => Self::encode(id, data).ok(),
            Id::Extended(_) => None,
        }
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        false
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Standard(self.id)
    }

    fn dlc(&self) -> usize {
        self.dlc.into()
    }

    fn data(&self) -> &[u8] {
        Frame::data(self)
    }
}

/// Number of payload words needed for `dlc` bytes
fn data_words(dlc: u8) -> usize {
    (usize::from(dlc) + 3) / 4
}

/// Part of a frame that failed verification
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Field {
    /// Frame identifier
    Identifier,
    /// Data length code
    Dlc,
    /// Payload byte at `index`
    Payload {
        /// Position of the first differing byte
        index: u8,
    },
}

/// First difference found by [`Frame::expect`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mismatch {
    /// Which field differs
    pub field: Field,
    /// Value that was sent
    pub expected: u32,
    /// Value that was received
    pub actual: u32,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.field {
            Field::Identifier => write!(f, "identifier")?,
            Field::Dlc => write!(f, "dlc")?,
            Field::Payload { index } => write!(f, "payload[{}]", index)?,
        }
        write!(f, ": expected {}, got {}", self.expected, self.actual)
    }
}

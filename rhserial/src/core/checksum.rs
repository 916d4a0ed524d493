//! CRC-CCITT frame check sequence.
//!
//! This is the same update step the RadioHead firmware uses (`RHcrc_ccitt_update`,
//! the reflected 0x1021 polynomial, i.e. 0x8408), computed bit at a time.
//!
//! # Example
//!
//! ```rust
//! use rhserial::core::{crc_ccitt_update, Fcs};
//!
//! let mut crc = 0;
//! crc = crc_ccitt_update(crc, 42);
//! crc = crc_ccitt_update(crc, 127);
//! assert_eq!(crc, 21811);
//!
//! let mut fcs = Fcs::new();
//! fcs.update(b"hello");
//! assert_eq!(fcs.value(), Fcs::compute(b"hello"));
//! ```

/// Reflected CRC-CCITT polynomial.
const CRC_CCITT_POLYNOMIAL: u16 = 0x8408;

/// Initial FCS value for every frame.
pub const FCS_INIT: u16 = 0xFFFF;

/// Updates a CRC-CCITT value with one byte.
#[inline]
pub const fn crc_ccitt_update(crc: u16, data: u8) -> u16 {
    let mut crc = crc ^ data as u16;
    let mut bit = 0;

    while bit < 8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ CRC_CCITT_POLYNOMIAL;
        } else {
            crc >>= 1;
        }
        bit += 1;
    }

    crc
}

/// Running frame check sequence.
///
/// No final inversion is applied: the value transmitted on the wire is the
/// running state itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fcs {
    state: u16,
}

impl Default for Fcs {
    fn default() -> Self {
        Self::new()
    }
}

impl Fcs {
    /// Creates an accumulator seeded with [`FCS_INIT`].
    #[inline]
    pub const fn new() -> Self {
        Self { state: FCS_INIT }
    }

    /// Adds a single byte.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        self.state = crc_ccitt_update(self.state, byte);
    }

    /// Adds every byte of `data`, in order.
    #[inline]
    pub fn update(&mut self, data: &[u8]) {
        for &byte in data {
            self.push(byte);
        }
    }

    /// Returns the current value.
    #[inline]
    pub const fn value(&self) -> u16 {
        self.state
    }

    /// Computes the FCS of `data` in one call.
    #[inline]
    pub fn compute(data: &[u8]) -> u16 {
        let mut fcs = Self::new();
        fcs.update(data);
        fcs.value()
    }

    /// Resets the accumulator to [`FCS_INIT`].
    #[inline]
    pub fn reset(&mut self) {
        self.state = FCS_INIT;
    }

    /// Creates an accumulator from a saved state.
    #[inline]
    pub const fn from_state(state: u16) -> Self {
        Self { state }
    }
}

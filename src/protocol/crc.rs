//! Reflected CRC arithmetic.
//!
//! The reversed (LSB-first) form needs fewer shifts on small controllers;
//! input words are not bit-reversed. Polynomials are stored without their
//! `2^width` term.

/// Running CRC accumulator over arbitrary-width input words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc {
    crc: u16,
    poly: u16,
    width: u8,
}

/// 6-bit CRC, used for short bus frames
pub const POLY6: u16 = 0x2c;

/// 11-bit CRC, used for longer bus frames
pub const POLY11: u16 = 0x583;

/// 16-bit CRC, used by the serial framer
pub const POLY16: u16 = 0xAC9A;

impl Crc {
    /// Creates a CRC accumulator for the given reversed polynomial
    pub fn new(poly: u16, width: u8) -> Self {
        debug_assert!(width <= 16);
        Crc { crc: 0, poly, width }
    }

    /// 6-bit bus CRC
    pub fn crc6() -> Self {
        Crc::new(POLY6, 6)
    }

    /// 11-bit bus CRC
    pub fn crc11() -> Self {
        Crc::new(POLY11, 11)
    }

    /// 16-bit serial CRC
    pub fn crc16() -> Self {
        Crc::new(POLY16, 16)
    }

    /// Clears the accumulator
    pub fn reset(&mut self) {
        self.crc = 0;
    }

    /// Mixes the low `bits` bits of `data` into the CRC
    pub fn update(&mut self, data: u16, bits: u8) {
        debug_assert!(bits <= 16);
        let mask = if bits == 16 { u16::MAX } else { (1 << bits) - 1 };
        let mut crc = self.crc ^ (data & mask);
        for _ in 0..bits {
            crc = if crc & 1 != 0 { (crc >> 1) ^ self.poly } else { crc >> 1 };
        }
        self.crc = crc;
    }

    /// Mixes a full byte into the CRC
    pub fn update_byte(&mut self, byte: u8) {
        self.update(byte as u16, 8);
    }

    /// Returns the accumulated CRC value
    pub fn finish(&self) -> u16 {
        self.crc
    }

    /// Width of the CRC in bits
    pub fn width(&self) -> u8 {
        self.width
    }
}
